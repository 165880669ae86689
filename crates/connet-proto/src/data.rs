//! Data-plane messages (ALPN `connet-direct`): the stream-open exchange
//! between a source and a destination, directly or through a relay.

use connet_core::Forward;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::{read_message, Error, WireError};

/// First message on a data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Open a proxied byte stream to the named forward's TCP target.
    Connect { to: Forward },
}

/// Reply to a data [`Request`]; an absent error means the target is dialed
/// and bytes flow next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub error: Option<Error>,
}

impl Response {
    #[must_use]
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn err(error: Error) -> Self {
        Self { error: Some(error) }
    }
}

/// Read a data-plane response, surfacing a carried error as [`WireError::Remote`].
pub async fn read_response<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Response, WireError> {
    let resp: Response = read_message(stream).await?;
    match resp.error {
        Some(err) => Err(WireError::Remote(err)),
        None => Ok(resp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{write_message, ErrorCode};

    #[tokio::test]
    async fn test_read_response_ok() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_message(&mut a, &Response::ok()).await.unwrap();
        assert!(read_response(&mut b).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_response_surfaces_remote_error() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let resp = Response::err(Error::new(ErrorCode::DestinationNotFound, "sws"));
        write_message(&mut a, &resp).await.unwrap();

        match read_response(&mut b).await {
            Err(WireError::Remote(err)) => assert_eq!(err.code, ErrorCode::DestinationNotFound),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
