//! Rebuilds the `data_dictionary` table from the vendor metric definitions.

use std::process::ExitCode;

fn main() -> ExitCode {
    match cvsamplerd::dictionary::run_dictionary_build() {
        Ok(entries) => {
            println!("cvsampler-dict: wrote {entries} data dictionary entries");
            ExitCode::from(cvsamplerd::exit::EX_OK)
        }
        Err(error) => {
            eprintln!("cvsampler-dict: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}
