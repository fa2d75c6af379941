//! In-process world: every rank is a thread, messages are queued in
//! per-rank mailboxes and windows are shared buffers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use super::{expect_len, slice_bounds, CommError, Communicator, RecvRequest, WindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    User(u32),
    Reduce,
    Broadcast,
    AllToAll,
}

type Queues = HashMap<(usize, Channel), VecDeque<Vec<f64>>>;
type WindowBuffer = Arc<Mutex<Vec<f64>>>;

#[derive(Default)]
struct Mailbox {
    queues: Mutex<Queues>,
    arrived: Condvar,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct Shared {
    size: usize,
    mailboxes: Vec<Mailbox>,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    windows: Mutex<HashMap<usize, Vec<Option<WindowBuffer>>>>,
    window_counters: Vec<AtomicUsize>,
    aborted: AtomicBool,
}

impl Shared {
    fn new(size: usize) -> Self {
        Self {
            size,
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            barrier: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            windows: Mutex::new(HashMap::new()),
            window_counters: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            aborted: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), CommError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(CommError::Aborted);
        }
        Ok(())
    }

    fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("local world of {} ranks aborted", self.size);
        // Waiters test the flag under these locks, so taking each lock before
        // notifying cannot lose a wakeup.
        for mailbox in &self.mailboxes {
            let _queues = mailbox.queues.lock();
            mailbox.arrived.notify_all();
        }
        let _state = self.barrier.lock();
        self.released.notify_all();
    }

    fn barrier(&self) -> Result<(), CommError> {
        let mut state = self.barrier.lock();
        self.check()?;
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        loop {
            if state.generation != generation {
                return Ok(());
            }
            self.check()?;
            self.released.wait(&mut state);
        }
    }

    fn deliver(&self, from: usize, to: usize, channel: Channel, data: Vec<f64>) -> Result<(), CommError> {
        self.check()?;
        let mailbox = &self.mailboxes[to];
        mailbox
            .queues
            .lock()
            .entry((from, channel))
            .or_default()
            .push_back(data);
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn take(&self, rank: usize, from: usize, channel: Channel) -> Result<Vec<f64>, CommError> {
        self.take_any(rank, &[(from, channel)]).map(|(_, data)| data)
    }

    fn take_any(&self, rank: usize, keys: &[(usize, Channel)]) -> Result<(usize, Vec<f64>), CommError> {
        let mailbox = &self.mailboxes[rank];
        let mut queues = mailbox.queues.lock();
        loop {
            for (pos, key) in keys.iter().enumerate() {
                if let Some(data) = queues.get_mut(key).and_then(VecDeque::pop_front) {
                    return Ok((pos, data));
                }
            }
            self.check()?;
            mailbox.arrived.wait(&mut queues);
        }
    }
}

/// Aborts the world if the owning rank thread unwinds.
struct AbortOnPanic<'a>(&'a Shared);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}

/// A world of `size` ranks living in the current process.
pub struct LocalWorld {
    shared: Arc<Shared>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Result<Self, CommError> {
        if size == 0 {
            return Err(CommError::EmptyWorld);
        }
        Ok(Self {
            shared: Arc::new(Shared::new(size)),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Endpoint for `rank`.
    pub fn communicator(&self, rank: usize) -> Result<LocalComm, CommError> {
        if rank >= self.size() {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size(),
            });
        }
        Ok(LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }

    /// One endpoint per rank, in rank order.
    pub fn communicators(&self) -> Vec<LocalComm> {
        (0..self.size())
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    /// Run `f` once per rank, each on its own thread, and collect the
    /// results in rank order.
    ///
    /// A rank that returns an error or panics aborts the world, so peers
    /// blocked in communication return [`CommError::Aborted`] instead of
    /// hanging. The first error in rank order is returned; all of them are
    /// logged.
    pub fn run<T, E, F>(size: usize, f: F) -> Result<Vec<T>, E>
    where
        T: Send,
        E: Send + From<CommError> + fmt::Display,
        F: Fn(LocalComm) -> Result<T, E> + Sync,
    {
        let world = Self::new(size)?;
        let outcomes: Vec<Result<T, E>> = std::thread::scope(|scope| {
            let handles: Vec<_> = world
                .communicators()
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    let shared = Arc::clone(&world.shared);
                    scope.spawn(move || {
                        let _guard = AbortOnPanic(&shared);
                        let result = f(comm);
                        if result.is_err() {
                            shared.abort();
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(E::from(CommError::RankPanicked(rank))))
                })
                .collect()
        });

        let mut values = Vec::with_capacity(size);
        let mut first_error = None;
        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(value) => values.push(value),
                Err(e) => {
                    error!("rank {rank} failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
}

/// Endpoint of one rank inside a [`LocalWorld`].
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl LocalComm {
    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.shared.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.shared.size,
            });
        }
        Ok(())
    }

    fn window(&self, window: WindowId, rank: usize) -> Result<WindowBuffer, CommError> {
        self.shared
            .windows
            .lock()
            .get(&window.0)
            .and_then(|slots| slots[rank].clone())
            .ok_or(CommError::UnknownWindow(window.0))
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.shared.barrier()
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<(), CommError> {
        let size = self.shared.size;
        if size == 1 {
            return self.shared.check();
        }
        // Gather on rank 0 and sum in rank order, so every rank sees the same
        // rounding.
        if self.rank == 0 {
            for src in 1..size {
                let part = self.shared.take(0, src, Channel::Reduce)?;
                expect_len(src, 0, buf.len(), &part)?;
                for (b, p) in buf.iter_mut().zip(&part) {
                    *b += p;
                }
            }
            for dest in 1..size {
                self.shared
                    .deliver(0, dest, Channel::Broadcast, buf.to_vec())?;
            }
        } else {
            self.shared
                .deliver(self.rank, 0, Channel::Reduce, buf.to_vec())?;
            let total = self.shared.take(self.rank, 0, Channel::Broadcast)?;
            expect_len(0, 0, buf.len(), &total)?;
            buf.copy_from_slice(&total);
        }
        Ok(())
    }

    fn send(&self, dest: usize, tag: u32, data: &[f64]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        self.shared
            .deliver(self.rank, dest, Channel::User(tag), data.to_vec())
    }

    fn irecv(&self, source: usize, tag: u32, len: usize) -> Result<RecvRequest, CommError> {
        self.check_rank(source)?;
        self.shared.check()?;
        Ok(RecvRequest { source, tag, len })
    }

    fn wait(&self, request: &RecvRequest) -> Result<Vec<f64>, CommError> {
        let data = self
            .shared
            .take(self.rank, request.source, Channel::User(request.tag))?;
        expect_len(request.source, request.tag, request.len, &data)?;
        Ok(data)
    }

    fn wait_any(&self, requests: &[RecvRequest]) -> Result<(usize, Vec<f64>), CommError> {
        if requests.is_empty() {
            return Err(CommError::BufferMismatch(
                "wait_any called without pending requests".into(),
            ));
        }
        let keys: Vec<_> = requests
            .iter()
            .map(|r| (r.source, Channel::User(r.tag)))
            .collect();
        let (pos, data) = self.shared.take_any(self.rank, &keys)?;
        let request = &requests[pos];
        expect_len(request.source, request.tag, request.len, &data)?;
        Ok((pos, data))
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
        let size = self.shared.size;
        slice_bounds("send", send_counts, send_displs, send.len(), size)?;
        slice_bounds("recv", recv_counts, recv_displs, recv.len(), size)?;

        for dest in (0..size).filter(|&r| r != self.rank) {
            let block = &send[send_displs[dest]..send_displs[dest] + send_counts[dest]];
            self.shared
                .deliver(self.rank, dest, Channel::AllToAll, block.to_vec())?;
        }

        let me = self.rank;
        let own = &send[send_displs[me]..send_displs[me] + send_counts[me]];
        expect_len(me, 0, recv_counts[me], own)?;
        recv[recv_displs[me]..recv_displs[me] + recv_counts[me]].copy_from_slice(own);

        for src in (0..size).filter(|&r| r != self.rank) {
            let block = self.shared.take(self.rank, src, Channel::AllToAll)?;
            expect_len(src, 0, recv_counts[src], &block)?;
            recv[recv_displs[src]..recv_displs[src] + recv_counts[src]].copy_from_slice(&block);
        }
        Ok(())
    }

    fn create_window(&self, len: usize) -> Result<WindowId, CommError> {
        self.shared.check()?;
        let id = self.shared.window_counters[self.rank].fetch_add(1, Ordering::Relaxed);
        {
            let mut windows = self.shared.windows.lock();
            let slots = windows
                .entry(id)
                .or_insert_with(|| vec![None; self.shared.size]);
            slots[self.rank] = Some(Arc::new(Mutex::new(vec![0.0; len])));
        }
        // Nobody may put before every rank has registered its buffer.
        self.shared.barrier()?;
        Ok(WindowId(id))
    }

    fn fence(&self, window: WindowId) -> Result<(), CommError> {
        self.window(window, self.rank)?;
        self.shared.barrier()
    }

    fn put(&self, window: WindowId, target: usize, offset: usize, data: &[f64]) -> Result<(), CommError> {
        self.check_rank(target)?;
        self.shared.check()?;
        let buffer = self.window(window, target)?;
        let mut buffer = buffer.lock();
        let end = offset + data.len();
        if end > buffer.len() {
            return Err(CommError::WindowBounds {
                offset,
                end,
                capacity: buffer.len(),
            });
        }
        buffer[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_window(&self, window: WindowId, out: &mut [f64]) -> Result<(), CommError> {
        let buffer = self.window(window, self.rank)?;
        let buffer = buffer.lock();
        if out.len() != buffer.len() {
            return Err(CommError::BufferMismatch(format!(
                "window holds {} values, output has {}",
                buffer.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&buffer);
        Ok(())
    }

    fn free_window(&self, window: WindowId) -> Result<(), CommError> {
        self.window(window, self.rank)?;
        // Outstanding puts from peers must land before the buffer goes away.
        self.shared.barrier()?;
        let mut windows = self.shared.windows.lock();
        if let Some(slots) = windows.get_mut(&window.0) {
            slots[self.rank] = None;
            if slots.iter().all(Option::is_none) {
                windows.remove(&window.0);
            }
        }
        Ok(())
    }

    fn abort(&self) {
        self.shared.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_reduce_sums_on_every_rank() {
        let results = LocalWorld::run(4, |comm| {
            let mut buf = vec![comm.rank() as f64, 1.0];
            comm.all_reduce_sum(&mut buf)?;
            Ok::<_, CommError>(buf)
        })
        .unwrap();
        for buf in results {
            assert_eq!(buf, vec![6.0, 4.0]);
        }
    }

    #[test]
    fn tagged_messages_and_wait_any() {
        let results = LocalWorld::run(3, |comm| {
            let me = comm.rank();
            for peer in (0..comm.size()).filter(|&p| p != me) {
                comm.send(peer, 7, &[me as f64; 2])?;
                comm.send(peer, 9, &[10.0 * me as f64])?;
            }
            let mut pending: Vec<_> = (0..comm.size())
                .filter(|&p| p != me)
                .map(|p| comm.irecv(p, 7, 2))
                .collect::<Result<_, _>>()?;
            let mut sum = 0.0;
            while !pending.is_empty() {
                let (pos, data) = comm.wait_any(&pending)?;
                assert_eq!(data[0], pending[pos].source as f64);
                sum += data[0] + data[1];
                pending.swap_remove(pos);
            }
            let tens: Vec<_> = (0..comm.size())
                .filter(|&p| p != me)
                .map(|p| comm.irecv(p, 9, 1))
                .collect::<Result<_, _>>()?;
            let tens: f64 = comm.wait_all(&tens)?.iter().map(|d| d[0]).sum();
            Ok::<_, CommError>((sum, tens))
        })
        .unwrap();

        // Ranks 0, 1, 2 each receive twice the ids of the other two.
        assert_eq!(results[0], (6.0, 30.0));
        assert_eq!(results[1], (4.0, 20.0));
        assert_eq!(results[2], (2.0, 10.0));
    }

    #[test]
    fn wrong_length_is_reported() {
        let err = LocalWorld::run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 1, &[1.0, 2.0, 3.0])?;
            } else {
                let req = comm.irecv(0, 1, 2)?;
                comm.wait(&req)?;
            }
            Ok::<_, CommError>(())
        })
        .unwrap_err();
        assert!(matches!(err, CommError::LengthMismatch { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn all_to_all_v_exchanges_blocks() {
        let results = LocalWorld::run(3, |comm| {
            let me = comm.rank();
            // Rank r contributes r + 1 copies of its id.
            let send = vec![me as f64; me + 1];
            let counts: Vec<usize> = (0..3).map(|r| r + 1).collect();
            let displs = vec![0, 1, 3];
            let mut recv = vec![-1.0; 6];
            comm.all_to_all_v(&send, &[me + 1; 3], &[0; 3], &mut recv, &counts, &displs)?;
            Ok::<_, CommError>(recv)
        })
        .unwrap();
        for recv in results {
            assert_eq!(recv, vec![0.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn window_epochs() {
        let results = LocalWorld::run(3, |comm| {
            let me = comm.rank();
            let win = comm.create_window(3)?;
            comm.fence(win)?;
            for target in 0..comm.size() {
                comm.put(win, target, me, &[me as f64 + 0.5])?;
            }
            comm.fence(win)?;
            let mut out = vec![0.0; 3];
            comm.read_window(win, &mut out)?;
            comm.free_window(win)?;
            Ok::<_, CommError>(out)
        })
        .unwrap();
        for out in results {
            assert_eq!(out, vec![0.5, 1.5, 2.5]);
        }
    }

    #[test]
    fn put_outside_window_fails() {
        let err = LocalWorld::run(1, |comm| {
            let win = comm.create_window(2)?;
            comm.put(win, 0, 1, &[1.0, 2.0])?;
            Ok::<_, CommError>(())
        })
        .unwrap_err();
        assert!(matches!(err, CommError::WindowBounds { end: 3, capacity: 2, .. }));
    }

    #[test]
    fn failing_rank_aborts_blocked_peers() {
        let err = LocalWorld::run(3, |comm| {
            if comm.rank() == 1 {
                return Err(CommError::BufferMismatch("injected".into()));
            }
            // Never satisfied: rank 1 leaves without sending.
            let req = comm.irecv(1, 42, 1)?;
            comm.wait(&req)?;
            Ok(())
        })
        .unwrap_err();
        // Rank 0 is blocked and reports the abort first.
        assert_eq!(err, CommError::Aborted);
    }

    #[test]
    fn panicking_rank_aborts_world() {
        let err = LocalWorld::run(2, |comm| {
            if comm.rank() == 0 {
                panic!("boom");
            }
            comm.barrier()?;
            Ok::<_, CommError>(())
        })
        .unwrap_err();
        assert_eq!(err, CommError::RankPanicked(0));
    }

    #[test]
    fn empty_world_is_rejected() {
        assert!(matches!(LocalWorld::new(0), Err(CommError::EmptyWorld)));
        let world = LocalWorld::new(2).unwrap();
        assert!(world.communicator(2).is_err());
    }
}
