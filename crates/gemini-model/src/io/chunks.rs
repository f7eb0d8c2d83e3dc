#[cfg(test)]
use std::collections::VecDeque;

use bytes::Bytes;
use reqwest::Response;

/// The body stream broke before it was complete.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkError(pub String);

/// An adapter for streaming byte chunks.
pub enum Chunks {
    Response(Response),
    #[cfg(test)]
    VecDeque(VecDeque<Bytes>),
}

impl Chunks {
    #[inline]
    pub fn from_response(response: Response) -> Self {
        Chunks::Response(response)
    }

    #[cfg(test)]
    pub fn from_vec_deque(vec: VecDeque<Bytes>) -> Self {
        Chunks::VecDeque(vec)
    }

    #[inline]
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ChunkError> {
        match self {
            Chunks::Response(response) => response
                .chunk()
                .await
                .map_err(|err| ChunkError(err.to_string())),
            #[cfg(test)]
            Chunks::VecDeque(vec) => Ok(vec.pop_front()),
        }
    }
}
