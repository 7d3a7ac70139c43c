use std::process::ExitCode;

fn main() -> ExitCode {
    dosecheck_cli::run()
}
