use std::process::ExitCode;

use silvasonic::config::ServiceKind;
use silvasonic::service;

#[tokio::main]
async fn main() -> ExitCode {
    match service::run(ServiceKind::Recorder).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("silvasonic-recorder: {e:#}");
            ExitCode::FAILURE
        }
    }
}
