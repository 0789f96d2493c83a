use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match simetrio::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error:?}");
            ExitCode::from(simetrio::error::exit_code(&error))
        }
    }
}
