//! MPI transport over `MPI_COMM_WORLD`.
//!
//! The caller initialises MPI and keeps the [`Universe`] alive for as long
//! as any [`MpiComm`] is in use. All calls must come from the thread that
//! initialised MPI.
//!
//! Sends are buffered (`MPI_Bsend`) so a rank can post every outgoing block
//! before it starts receiving, as the exchange strategies do; the buffer is
//! attached to the universe by [`MpiComm::new`]. Receives are matched when
//! waited on. MPI keeps messages with the same source and tag in order,
//! which is the ordering the strategies rely on.
//!
//! There is no window support: [`Communicator::create_window`] returns
//! [`CommError::Unsupported`], so the one-sided strategy is rejected when the
//! operator is built.

use std::mem::size_of;

use ::mpi::collective::SystemOperation;
use ::mpi::datatype::{Partition, PartitionMut};
use ::mpi::environment::Universe;
use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::{Communicator as MpiCommunicator, CommunicatorCollectives, Destination, Source};
use ::mpi::{Count, Tag};
use log::{debug, error};

use super::{expect_len, slice_bounds, CommError, Communicator, RecvRequest, WindowId};

/// Bookkeeping bytes reserved per buffered message; above
/// `MPI_BSEND_OVERHEAD` of the common implementations.
const BSEND_OVERHEAD: usize = 256;

/// Endpoint of this process in `MPI_COMM_WORLD`.
#[derive(Debug)]
pub struct MpiComm {
    rank: usize,
    size: usize,
}

impl MpiComm {
    /// Attach a send buffer of `send_buffer_bytes` to `universe` and wrap
    /// the world communicator.
    ///
    /// The buffer must hold every message a rank has in flight at once; see
    /// [`MpiComm::send_buffer_bytes`].
    pub fn new(universe: &mut Universe, send_buffer_bytes: usize) -> Self {
        universe.set_buffer_size(send_buffer_bytes);
        let world = universe.world();
        let comm = Self {
            rank: world.rank() as usize,
            size: world.size() as usize,
        };
        debug!(
            "mpi rank {}/{}: {} byte send buffer",
            comm.rank, comm.size, send_buffer_bytes
        );
        comm
    }

    /// Buffer size for `messages` in-flight messages carrying `values`
    /// doubles in total.
    pub fn send_buffer_bytes(values: usize, messages: usize) -> usize {
        values * size_of::<f64>() + messages * BSEND_OVERHEAD
    }

    fn world(&self) -> SimpleCommunicator {
        SimpleCommunicator::world()
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }
}

fn mpi_tag(tag: u32) -> Result<Tag, CommError> {
    Tag::try_from(tag).map_err(|_| CommError::Transport(format!("tag {tag} exceeds the MPI tag range")))
}

fn mpi_counts(values: &[usize]) -> Result<Vec<Count>, CommError> {
    values
        .iter()
        .map(|&v| Count::try_from(v).map_err(|_| CommError::Transport(format!("count {v} exceeds the MPI count range"))))
        .collect()
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.world().barrier();
        Ok(())
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<(), CommError> {
        let local = buf.to_vec();
        self.world()
            .all_reduce_into(&local[..], buf, SystemOperation::sum());
        Ok(())
    }

    fn send(&self, dest: usize, tag: u32, data: &[f64]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        let tag = mpi_tag(tag)?;
        self.world()
            .process_at_rank(dest as i32)
            .buffered_send_with_tag(data, tag);
        Ok(())
    }

    fn irecv(&self, source: usize, tag: u32, len: usize) -> Result<RecvRequest, CommError> {
        self.check_rank(source)?;
        mpi_tag(tag)?;
        Ok(RecvRequest { source, tag, len })
    }

    fn wait(&self, request: &RecvRequest) -> Result<Vec<f64>, CommError> {
        let (data, _status) = self
            .world()
            .process_at_rank(request.source as i32)
            .receive_vec_with_tag::<f64>(mpi_tag(request.tag)?);
        expect_len(request.source, request.tag, request.len, &data)?;
        Ok(data)
    }

    fn wait_any(&self, requests: &[RecvRequest]) -> Result<(usize, Vec<f64>), CommError> {
        if requests.is_empty() {
            return Err(CommError::BufferMismatch(
                "wait_any called without pending requests".into(),
            ));
        }
        let tags = requests
            .iter()
            .map(|r| mpi_tag(r.tag))
            .collect::<Result<Vec<_>, _>>()?;
        let world = self.world();
        loop {
            for (pos, (request, &tag)) in requests.iter().zip(&tags).enumerate() {
                let source = world.process_at_rank(request.source as i32);
                if let Some((message, _status)) = source.immediate_matched_probe_with_tag(tag) {
                    let (data, _status) = message.matched_receive_vec::<f64>();
                    expect_len(request.source, request.tag, request.len, &data)?;
                    return Ok((pos, data));
                }
            }
            std::thread::yield_now();
        }
    }

    fn all_to_all_v(
        &self,
        send: &[f64],
        send_counts: &[usize],
        send_displs: &[usize],
        recv: &mut [f64],
        recv_counts: &[usize],
        recv_displs: &[usize],
    ) -> Result<(), CommError> {
        slice_bounds("send", send_counts, send_displs, send.len(), self.size)?;
        slice_bounds("recv", recv_counts, recv_displs, recv.len(), self.size)?;
        let send = Partition::new(send, mpi_counts(send_counts)?, mpi_counts(send_displs)?);
        let mut recv = PartitionMut::new(recv, mpi_counts(recv_counts)?, mpi_counts(recv_displs)?);
        self.world().all_to_all_varcount_into(&send, &mut recv);
        Ok(())
    }

    fn create_window(&self, _len: usize) -> Result<WindowId, CommError> {
        Err(CommError::Unsupported("one-sided windows"))
    }

    fn fence(&self, window: WindowId) -> Result<(), CommError> {
        Err(CommError::UnknownWindow(window.0))
    }

    fn put(&self, window: WindowId, _target: usize, _offset: usize, _data: &[f64]) -> Result<(), CommError> {
        Err(CommError::UnknownWindow(window.0))
    }

    fn read_window(&self, window: WindowId, _out: &mut [f64]) -> Result<(), CommError> {
        Err(CommError::UnknownWindow(window.0))
    }

    fn free_window(&self, window: WindowId) -> Result<(), CommError> {
        Err(CommError::UnknownWindow(window.0))
    }

    fn abort(&self) {
        error!("mpi rank {}: aborting MPI_COMM_WORLD", self.rank);
        self.world().abort(1)
    }
}
