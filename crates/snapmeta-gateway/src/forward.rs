//! Driver-to-caller stream forwarding.
//!
//! Two separable concerns: the relay loop (receive one record, translate,
//! send one record) and the classification of terminal errors. There is no
//! buffering beyond the single in-flight record, so a slow caller blocks the
//! driver receive and back-pressure propagates to the driver.

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tonic::{Code, Status};

use snapmeta_api::{csi, gateway};

use crate::error::GatewayError;

/// Relay `inbound` driver records into `tx` until end-of-stream.
///
/// Returns the terminal state of the relay: `Ok` on a clean driver EOF, the
/// classified status otherwise. A driver error is also delivered into `tx` so
/// the caller observes it as the stream's terminal status.
pub(crate) async fn forward<In, T, U, F>(
    mut inbound: In,
    tx: mpsc::Sender<Result<U, Status>>,
    convert: F,
) -> Result<(), Status>
where
    In: Stream<Item = Result<T, Status>> + Unpin,
    F: Fn(T) -> U,
{
    loop {
        match inbound.next().await {
            None => return Ok(()),
            Some(Ok(record)) => {
                if let Err(err) = tx.send(Ok(convert(record))).await {
                    // The caller is gone; there is nowhere left to report to.
                    return Err(GatewayError::SendResponse(err.to_string()).into());
                }
            }
            Some(Err(status)) => {
                let classified = classify_driver_error(status);
                let echo = Status::new(classified.code(), classified.message());
                let _ = tx.send(Err(classified)).await;
                return Err(echo);
            }
        }
    }
}

/// Map a terminal driver-stream error into the caller-visible status.
///
/// A structured status from the driver passes through with code and message
/// untouched; callers reason about `Aborted`, `ResourceExhausted` and friends
/// themselves. `Unknown` is how an unstructured driver failure surfaces on a
/// tonic client stream, and only that gets wrapped.
pub(crate) fn classify_driver_error(status: Status) -> Status {
    if status.code() == Code::Unknown {
        GatewayError::DriverResponse(status.message().to_string()).into()
    } else {
        status
    }
}

pub(crate) fn convert_allocated(
    resp: csi::GetMetadataAllocatedResponse,
) -> gateway::GetMetadataAllocatedResponse {
    gateway::GetMetadataAllocatedResponse {
        block_metadata_type: resp.block_metadata_type,
        volume_capacity_bytes: resp.volume_capacity_bytes,
        block_metadata: convert_blocks(resp.block_metadata),
    }
}

pub(crate) fn convert_delta(
    resp: csi::GetMetadataDeltaResponse,
) -> gateway::GetMetadataDeltaResponse {
    gateway::GetMetadataDeltaResponse {
        block_metadata_type: resp.block_metadata_type,
        volume_capacity_bytes: resp.volume_capacity_bytes,
        block_metadata: convert_blocks(resp.block_metadata),
    }
}

fn convert_blocks(blocks: Vec<csi::BlockMetadata>) -> Vec<gateway::BlockMetadata> {
    blocks
        .into_iter()
        .map(|b| gateway::BlockMetadata {
            byte_offset: b.byte_offset,
            size_bytes: b.size_bytes,
        })
        .collect()
}
