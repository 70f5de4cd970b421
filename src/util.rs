//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::{Error, Result};

/// Await `fut`, failing with [`Error::Timeout`] once `duration` elapses.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    timeout(duration, fut)
        .await
        .map_err(|_| Error::Timeout(duration))
}

/// Wait for a spawned task, bounded by `duration`.
pub async fn join_with_timeout<T>(duration: Duration, handle: JoinHandle<T>) -> Result<T> {
    match timeout(duration, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Serde adapter storing 32-byte digests as lowercase hex strings.
pub(crate) mod hex32 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(de::Error::custom)?;
        raw.try_into()
            .map_err(|v: Vec<u8>| de::Error::invalid_length(v.len(), &"32 bytes"))
    }
}
