//! Inter-rank communication.
//!
//! The [`Communicator`] trait is the only channel between ranks. It carries
//! the rank/topology context explicitly, so the operator never reaches for a
//! process-global handle. The primitives mirror what a message-passing
//! runtime offers: point-to-point messages with tags, collective sums and
//! all-to-all exchanges, and one-sided windows with fence epochs.
//!
//! [`LocalWorld`] runs a whole world inside one process, one thread per
//! rank. It backs the test suite and single-node runs of the CLI. With the
//! `mpi` feature, [`MpiComm`] maps the same primitives onto
//! `MPI_COMM_WORLD`, one process per rank.

mod local;
#[cfg(feature = "mpi")]
mod mpi;

pub use local::{LocalComm, LocalWorld};
#[cfg(feature = "mpi")]
pub use self::mpi::MpiComm;

use thiserror::Error;

/// Errors raised by communicators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("Rank {rank} is out of range for a world of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("World size must be positive")]
    EmptyWorld,

    #[error("Communication aborted after a failure on another rank")]
    Aborted,

    #[error("Rank {0} panicked")]
    RankPanicked(usize),

    #[error("Message from rank {from} with tag {tag} has {actual} values, expected {expected}")]
    LengthMismatch {
        from: usize,
        tag: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Buffer mismatch: {0}")]
    BufferMismatch(String),

    #[error("Unknown window {0}")]
    UnknownWindow(usize),

    #[error("Window access {offset}..{end} exceeds window of {capacity} values")]
    WindowBounds {
        offset: usize,
        end: usize,
        capacity: usize,
    },

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub(crate) fn expect_len(from: usize, tag: u32, expected: usize, data: &[f64]) -> Result<(), CommError> {
    if data.len() != expected {
        return Err(CommError::LengthMismatch {
            from,
            tag,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Check that every `(count, displ)` block of an all-to-all buffer fits.
pub(crate) fn slice_bounds(
    what: &str,
    counts: &[usize],
    displs: &[usize],
    len: usize,
    size: usize,
) -> Result<(), CommError> {
    if counts.len() != size || displs.len() != size {
        return Err(CommError::BufferMismatch(format!(
            "{what} counts/displacements must have one entry per rank ({size})"
        )));
    }
    for (count, displ) in counts.iter().zip(displs) {
        if displ + count > len {
            return Err(CommError::BufferMismatch(format!(
                "{what} block {displ}..{} exceeds buffer of {len}",
                displ + count
            )));
        }
    }
    Ok(())
}

/// A posted receive; completed by [`Communicator::wait`] or
/// [`Communicator::wait_any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub source: usize,
    pub tag: u32,
    pub len: usize,
}

/// Handle of a one-sided communication window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub(crate) usize);

/// Endpoint of one rank in a communicating world.
///
/// Collective operations (`barrier`, `all_reduce_sum`, `all_to_all_v`,
/// window creation, fences and window release) must be entered by every
/// rank in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self) -> Result<(), CommError>;

    /// Element-wise sum of `buf` over all ranks, result on every rank.
    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<(), CommError>;

    /// Buffered send; the data is copied before returning.
    fn send(&self, dest: usize, tag: u32, data: &[f64]) -> Result<(), CommError>;

    /// Post a receive of `len` values from `source` with `tag`.
    fn irecv(&self, source: usize, tag: u32, len: usize) -> Result<RecvRequest, CommError>;

    /// Block until `request` completes.
    fn wait(&self, request: &RecvRequest) -> Result<Vec<f64>, CommError>;

    /// Block until any of `requests` completes; returns its position and payload.
    fn wait_any(&self, requests: &[RecvRequest]) -> Result<(usize, Vec<f64>), CommError>;

    fn wait_all(&self, requests: &[RecvRequest]) -> Result<Vec<Vec<f64>>, CommError> {
        requests.iter().map(|r| self.wait(r)).collect()
    }

    /// Personalised all-to-all: rank `r` receives
    /// `send[send_displs[r]..][..send_counts[r]]` from every peer into
    /// `recv[recv_displs[peer]..][..recv_counts[peer]]`.
    #[allow(clippy::too_many_arguments)]
    fn all_to_all_v(
        &self,
        send: &[f64],
        send_counts: &[usize],
        send_displs: &[usize],
        recv: &mut [f64],
        recv_counts: &[usize],
        recv_displs: &[usize],
    ) -> Result<(), CommError>;

    /// Collectively create a zero-initialised window of `len` values per rank.
    ///
    /// Transports without one-sided support return [`CommError::Unsupported`].
    fn create_window(&self, len: usize) -> Result<WindowId, CommError>;

    /// Close the current access epoch on `window` and open the next one.
    fn fence(&self, window: WindowId) -> Result<(), CommError>;

    /// Write `data` into `target`'s window at `offset`.
    fn put(&self, window: WindowId, target: usize, offset: usize, data: &[f64])
        -> Result<(), CommError>;

    /// Copy this rank's window contents into `out`.
    fn read_window(&self, window: WindowId, out: &mut [f64]) -> Result<(), CommError>;

    /// Collectively release `window`.
    fn free_window(&self, window: WindowId) -> Result<(), CommError>;

    /// Abort the world: every blocked or future operation on any rank fails
    /// with [`CommError::Aborted`].
    fn abort(&self);
}
