pub mod copay;
pub mod dose;
pub mod issue;
pub mod order;
pub mod payment;
pub mod product;
pub mod visit;
