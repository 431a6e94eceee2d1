//! Request loop for one supervisor connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::ipc::ServerChannel;

use super::service::WorkerService;

/// Accept the handshake on `stream` and serve requests until the
/// supervisor disconnects.
///
/// Each request runs on its own task, so a long `Execute` never delays
/// `Abort`. Returns once the connection closes.
pub async fn serve<S>(stream: S, token: &str, pid: u32, service: Arc<WorkerService>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut channel = ServerChannel::accept(stream, token, pid).await?;
    tracing::debug!("Supervisor connected");

    let responder = channel.responder();
    let push = channel.push_sender();

    while let Some((id, request)) = channel.next_request().await? {
        let service = service.clone();
        let responder = responder.clone();
        let push = push.clone();
        tokio::spawn(async move {
            let name = request.name();
            tracing::debug!("Serving {} request {}", name, id);
            let result = service.dispatch(request, &push).await;
            if let Err(e) = &result {
                tracing::debug!("{} request {} failed: {}", name, id, e);
            }
            responder.respond(id, result);
        });
    }

    tracing::debug!("Supervisor disconnected");
    Ok(())
}
