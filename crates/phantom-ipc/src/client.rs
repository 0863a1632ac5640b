//! Client side of the pipe protocol, used by hooks and the CLI.

use std::path::Path;

use tokio::net::UnixStream;
use tracing::debug;

use crate::frame::{read_frame, write_frame};
use crate::protocol::{Request, Response};
use crate::Result;

/// One connection to a mount process.
pub struct PipeClient {
    stream: UnixStream,
}

impl PipeClient {
    /// Connects to the enlistment's pipe.
    pub async fn connect<P: AsRef<Path>>(pipe_path: P) -> Result<Self> {
        let stream = UnixStream::connect(pipe_path.as_ref()).await?;
        Ok(Self { stream })
    }

    /// Sends one request and waits for its response. Requests on a
    /// single connection are strictly serialized.
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let rendered = request.render();
        debug!(frame = %rendered.replace('\0', "␀"), "ipc send");
        write_frame(&mut self.stream, &rendered).await?;
        let reply = read_frame(&mut self.stream).await?;
        debug!(frame = %reply.replace('\0', "␀"), "ipc recv");
        Response::parse(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn request_response_over_socket() {
        let temp = tempfile::tempdir().unwrap();
        let pipe = temp.path().join("enlistment.pipe");
        let listener = UnixListener::bind(&pipe).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap();
            let request = Request::parse(&frame).unwrap();
            assert_eq!(request, Request::GetStatus);
            write_frame(&mut stream, &Response::MountNotReady.render())
                .await
                .unwrap();
        });

        let mut client = PipeClient::connect(&pipe).await.unwrap();
        let response = client.request(&Request::GetStatus).await.unwrap();
        assert_eq!(response, Response::MountNotReady);
        server.await.unwrap();
    }
}
