use std::process::ExitCode;

use silvasonic::config::ServiceKind;
use silvasonic::service;

#[tokio::main]
async fn main() -> ExitCode {
    match service::run(ServiceKind::Controller).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("silvasonic-controller: {e:#}");
            ExitCode::FAILURE
        }
    }
}
