use dbreach::{cli::start, error::ProbeError};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match start::start().await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err
                .downcast_ref::<ProbeError>()
                .map_or(1, |e| e.kind().exit_code());
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
