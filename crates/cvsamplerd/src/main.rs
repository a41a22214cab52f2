use std::process::ExitCode;

#[cfg(unix)]
fn main() -> ExitCode {
    match cvsamplerd::run_daemon() {
        Ok(_) => ExitCode::from(cvsamplerd::exit::EX_OK),
        Err(error) => {
            eprintln!("cvsamplerd: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    eprintln!("cvsamplerd: only Unix platforms are supported");
    ExitCode::from(cvsamplerd::exit::EX_SOFTWARE)
}
