/*!
FIFO read-out engine.

Three threads per session:
1. Reader: polls the FIFO every poll interval, turns every non-empty read into
   a [`DataChunk`] and keeps the [`ThroughputWindow`]. Closing the chunk
   channel after the last chunk tells the worker to finish.
2. Worker: applies the optional filter/converter, runs the data callback and
   fills the history buffer.
3. Watchdog: samples the link status every 10 poll intervals and reports
   violations through the errback.

All errors go through the errback. Without an errback they are logged and
the first one is returned by [`FifoReadout::stop`].
*/

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{LinkError, ReadoutError};
use crate::link::{self, LinkStatus};
use crate::transport::Transport;

/// Link flags stored in [`DataChunk::error_code`]
pub const ERROR_RX_SYNC: u32 = 0x1;
pub const ERROR_8B10B: u32 = 0x2;
pub const ERROR_FIFO_DISCARD: u32 = 0x4;

/// Watchdog period in poll intervals
const WATCHDOG_POLLS: u32 = 10;

/// Data callback, called from the worker thread for every chunk
pub type Callback = Box<dyn FnMut(&DataChunk) -> anyhow::Result<()> + Send>;

/// Error callback, called from any read-out thread
pub type Errback = Arc<dyn Fn(ReadoutError) + Send + Sync>;

/// Keep a word when true
pub type WordFilter = Arc<dyn Fn(u32) -> bool + Send + Sync>;

pub type WordConverter = Arc<dyn Fn(u32) -> u32 + Send + Sync>;

/// Words of one non-empty FIFO read
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    pub words: Vec<u32>,
    /// Seconds since the epoch of the previous read
    pub timestamp_start: f64,
    /// Seconds since the epoch of this read
    pub timestamp_stop: f64,
    pub error_code: u32,
}

/// Read-out lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutState {
    Idle,
    Running,
    Stopping,
    ForceStopping,
}

/// Ring of per-poll word counts covering a fixed period
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    counts: VecDeque<usize>,
    capacity: usize,
    poll_interval: Duration,
    seen_data: bool,
}

impl ThroughputWindow {
    pub fn new(period: Duration, poll_interval: Duration) -> Self {
        let polls = period.as_secs_f64() / poll_interval.as_secs_f64().max(f64::EPSILON);
        let capacity = (polls.round() as usize).max(1);
        Self {
            counts: VecDeque::with_capacity(capacity),
            capacity,
            poll_interval,
            seen_data: false,
        }
    }

    pub fn record(&mut self, words: usize) {
        if self.counts.len() == self.capacity {
            self.counts.pop_front();
        }
        self.counts.push_back(words);
        self.seen_data |= words > 0;
    }

    /// Average rate over the window, `None` until data was seen
    pub fn words_per_second(&self) -> Option<f64> {
        if !self.seen_data || self.counts.is_empty() {
            return None;
        }
        let total: usize = self.counts.iter().sum();
        Some(total as f64 / (self.counts.len() as f64 * self.poll_interval.as_secs_f64()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct ReadoutSettings {
    pub poll_interval: Duration,
    /// Period covered by the throughput window
    pub throughput_period: Duration,
    /// RX channels sampled by the watchdog
    pub rx_channels: Vec<usize>,
    /// Maximum number of chunks kept in the history buffer
    pub history_capacity: usize,
}

impl Default for ReadoutSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            throughput_period: Duration::from_secs(10),
            rx_channels: vec![0],
            history_capacity: 10_000,
        }
    }
}

/// Per-session options of [`FifoReadout::start`]
#[derive(Clone)]
pub struct StartOptions {
    pub reset_rx: bool,
    pub reset_fifo: bool,
    pub clear_buffer: bool,
    /// Keep chunks in the history buffer for [`FifoReadout::data_from_buffer`]
    pub fill_buffer: bool,
    /// Report [`LinkError::NoDataTimeout`] once if no data arrives for this long
    pub no_data_timeout: Option<Duration>,
    pub filter: Option<WordFilter>,
    pub converter: Option<WordConverter>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            reset_rx: false,
            reset_fifo: true,
            clear_buffer: false,
            fill_buffer: false,
            no_data_timeout: None,
            filter: None,
            converter: None,
        }
    }
}

/// Routes errors to the errback, or keeps the first one for `stop`
#[derive(Clone)]
struct Reporter {
    errback: Option<Errback>,
    failure: Arc<Mutex<Option<ReadoutError>>>,
}

impl Reporter {
    /// Returns false if no errback is registered
    fn report(&self, err: ReadoutError) -> bool {
        match &self.errback {
            Some(errback) => {
                errback(err);
                true
            }
            None => {
                error!("FIFO read-out error: {}", err);
                if let Ok(mut failure) = self.failure.lock() {
                    failure.get_or_insert(err);
                }
                false
            }
        }
    }

    fn take_failure(&self) -> Option<ReadoutError> {
        self.failure.lock().ok().and_then(|mut failure| failure.take())
    }
}

struct Session {
    stop: CancellationToken,
    force_stop: CancellationToken,
    reader: JoinHandle<()>,
    worker: JoinHandle<()>,
    watchdog: JoinHandle<()>,
    reader_done: Receiver<()>,
    rate_requests: Sender<()>,
    rate_results: Receiver<Option<f64>>,
    reporter: Reporter,
}

/// FIFO read-out with reader, worker and watchdog threads
pub struct FifoReadout {
    transport: Arc<dyn Transport>,
    settings: ReadoutSettings,
    state: Mutex<ReadoutState>,
    history: Arc<Mutex<VecDeque<DataChunk>>>,
    session: Option<Session>,
}

impl FifoReadout {
    pub fn new(transport: Arc<dyn Transport>, settings: ReadoutSettings) -> Self {
        Self {
            transport,
            settings,
            state: Mutex::new(ReadoutState::Idle),
            history: Arc::new(Mutex::new(VecDeque::new())),
            session: None,
        }
    }

    pub fn settings(&self) -> &ReadoutSettings {
        &self.settings
    }

    pub fn state(&self) -> ReadoutState {
        self.state.lock().map(|state| *state).unwrap_or(ReadoutState::Idle)
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    fn set_state(&self, new_state: ReadoutState) {
        if let Ok(mut state) = self.state.lock() {
            debug!("FIFO read-out state {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
    }

    /// Start the read-out threads
    pub fn start(&mut self, callback: Callback, errback: Option<Errback>, options: StartOptions) -> Result<(), ReadoutError> {
        if self.session.is_some() {
            return Err(ReadoutError::AlreadyRunning);
        }
        if options.reset_rx {
            self.reset_rx()?;
        }
        if options.reset_fifo {
            self.reset_fifo()?;
        }
        if options.clear_buffer {
            self.data_from_buffer();
        }

        let poll_interval = self.settings.poll_interval;
        let stop = CancellationToken::new();
        let force_stop = CancellationToken::new();
        let reporter = Reporter {
            errback,
            failure: Arc::new(Mutex::new(None)),
        };
        let link_flags = Arc::new(AtomicU32::new(0));
        let (chunk_tx, chunk_rx) = unbounded::<DataChunk>();
        let (done_tx, reader_done) = bounded::<()>(1);
        let (request_tx, request_rx) = bounded::<()>(1);
        let (result_tx, result_rx) = bounded::<Option<f64>>(1);

        let reader = {
            let context = ReaderContext {
                transport: Arc::clone(&self.transport),
                poll_interval,
                window: ThroughputWindow::new(self.settings.throughput_period, poll_interval),
                no_data_timeout: options.no_data_timeout,
                chunks: chunk_tx,
                stop: stop.clone(),
                force_stop: force_stop.clone(),
                rate_requests: request_rx,
                rate_results: result_tx,
                reporter: reporter.clone(),
                link_flags: Arc::clone(&link_flags),
                _done: done_tx,
            };
            thread::spawn(move || context.run())
        };

        let worker = {
            let context = WorkerContext {
                chunks: chunk_rx,
                poll_interval,
                callback,
                filter: options.filter,
                converter: options.converter,
                history: options
                    .fill_buffer
                    .then(|| (Arc::clone(&self.history), self.settings.history_capacity)),
                reporter: reporter.clone(),
            };
            thread::spawn(move || context.run())
        };

        let watchdog = {
            let transport = Arc::clone(&self.transport);
            let channels = self.settings.rx_channels.clone();
            let stop = stop.clone();
            let reporter = reporter.clone();
            thread::spawn(move || watchdog(transport, channels, poll_interval * WATCHDOG_POLLS, stop, reporter, link_flags))
        };

        self.session = Some(Session {
            stop,
            force_stop,
            reader,
            worker,
            watchdog,
            reader_done,
            rate_requests: request_tx,
            rate_results: result_rx,
            reporter,
        });
        self.set_state(ReadoutState::Running);
        info!("🚀 FIFO read-out started (poll interval {:?})", poll_interval);
        Ok(())
    }

    /// Stop the read-out. The reader gets `timeout` to drain the FIFO and
    /// finish on its own, after which it is forced to abort and
    /// [`LinkError::StopTimeout`] is reported.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), ReadoutError> {
        let session = self.session.take().ok_or(ReadoutError::NotRunning)?;
        self.set_state(ReadoutState::Stopping);
        session.stop.cancel();

        let finished = !matches!(session.reader_done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout));
        if !finished {
            warn!("FIFO reader still running after {:?}, aborting", timeout);
            self.set_state(ReadoutState::ForceStopping);
            session.force_stop.cancel();
            session.reporter.report(LinkError::StopTimeout(timeout).into());
        }

        let reader = session.reader.join();
        let worker = session.worker.join();
        let watchdog = session.watchdog.join();
        self.set_state(ReadoutState::Idle);
        info!("🛑 FIFO read-out stopped");

        reader.map_err(|_| ReadoutError::ThreadPanic("reader"))?;
        worker.map_err(|_| ReadoutError::ThreadPanic("worker"))?;
        watchdog.map_err(|_| ReadoutError::ThreadPanic("watchdog"))?;
        match session.reporter.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Average word rate over the throughput window.
    ///
    /// Asks the reader through a single-slot handoff and gives up after two
    /// poll intervals, returning `None` if no answer or no data is available.
    pub fn words_per_second(&self) -> Option<f64> {
        let session = self.session.as_ref()?;
        while session.rate_results.try_recv().is_ok() {}
        // a pending request is answered just the same
        let _ = session.rate_requests.try_send(());
        session
            .rate_results
            .recv_timeout(self.settings.poll_interval * 2)
            .ok()
            .flatten()
    }

    /// Take all chunks collected in the history buffer
    pub fn data_from_buffer(&self) -> Vec<DataChunk> {
        self.history
            .lock()
            .map(|mut history| history.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn reset_rx(&self) -> Result<(), ReadoutError> {
        info!("Resetting RX channel(s) {:?}", self.settings.rx_channels);
        link::reset_rx(self.transport.as_ref(), &self.settings.rx_channels)?;
        Ok(())
    }

    pub fn reset_fifo(&self) -> Result<(), ReadoutError> {
        link::reset_fifo(self.transport.as_ref())?;
        Ok(())
    }

    /// Best-effort link report, used before surfacing a fatal error
    pub fn log_link_status(&self) -> Option<LinkStatus> {
        link::log_link_status(self.transport.as_ref(), &self.settings.rx_channels)
    }
}

impl Drop for FifoReadout {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("FIFO read-out dropped while running, stopping");
            if let Err(e) = self.stop(Duration::from_secs(10)) {
                error!("Failed to stop FIFO read-out: {}", e);
            }
        }
    }
}

fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

struct ReaderContext {
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
    window: ThroughputWindow,
    no_data_timeout: Option<Duration>,
    chunks: Sender<DataChunk>,
    stop: CancellationToken,
    force_stop: CancellationToken,
    rate_requests: Receiver<()>,
    rate_results: Sender<Option<f64>>,
    reporter: Reporter,
    link_flags: Arc<AtomicU32>,
    // dropped when the reader returns
    _done: Sender<()>,
}

impl ReaderContext {
    fn run(mut self) {
        let start_time = Instant::now();
        let mut last_data = Instant::now();
        let mut last_read = epoch_seconds();
        let mut no_data_timeout = self.no_data_timeout;
        let mut total_words = 0u64;
        let mut chunk_count = 0u64;
        let mut read_errors = 0u64;

        while !self.force_stop.is_cancelled() {
            let iteration_start = Instant::now();

            if let Some(timeout) = no_data_timeout {
                if last_data.elapsed() > timeout {
                    self.reporter.report(LinkError::NoDataTimeout(timeout).into());
                    no_data_timeout = None;
                }
            }
            if self.rate_requests.try_recv().is_ok() {
                let _ = self.rate_results.try_send(self.window.words_per_second());
            }

            match self.transport.read_fifo() {
                Ok(words) if !words.is_empty() => {
                    let now = epoch_seconds();
                    let count = words.len();
                    let chunk = DataChunk {
                        words,
                        timestamp_start: last_read,
                        timestamp_stop: now,
                        error_code: self.link_flags.load(Ordering::Relaxed),
                    };
                    last_read = now;
                    last_data = Instant::now();
                    self.window.record(count);
                    total_words += count as u64;
                    chunk_count += 1;
                    if self.chunks.send(chunk).is_err() {
                        warn!("FIFO worker is gone, dropping data");
                    }
                }
                Ok(_) => {
                    self.window.record(0);
                    if self.stop.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    read_errors += 1;
                    if !self.reporter.report(e.into()) || self.stop.is_cancelled() {
                        break;
                    }
                }
            }

            let remaining = self.poll_interval.saturating_sub(iteration_start.elapsed());
            if !remaining.is_zero() && self.force_stop.wait_timeout(remaining) {
                break;
            }
        }

        let elapsed = start_time.elapsed();
        info!("📈 FIFO reader final stats:");
        info!("   Chunks: {}", chunk_count);
        info!("   Words: {}", total_words);
        info!("   Read errors: {}", read_errors);
        info!("   Duration: {:.1}s", elapsed.as_secs_f64());
    }
}

struct WorkerContext {
    chunks: Receiver<DataChunk>,
    poll_interval: Duration,
    callback: Callback,
    filter: Option<WordFilter>,
    converter: Option<WordConverter>,
    history: Option<(Arc<Mutex<VecDeque<DataChunk>>>, usize)>,
    reporter: Reporter,
}

impl WorkerContext {
    fn run(mut self) {
        let mut processed = 0u64;
        let mut callback_errors = 0u64;
        let mut history_dropped = 0u64;

        loop {
            let mut chunk = match self.chunks.recv_timeout(self.poll_interval) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => continue,
                // reader finished and every chunk was taken
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if self.filter.is_some() || self.converter.is_some() {
                chunk.words = chunk
                    .words
                    .into_iter()
                    .filter(|&word| self.filter.as_ref().map_or(true, |filter| filter(word)))
                    .map(|word| self.converter.as_ref().map_or(word, |convert| convert(word)))
                    .collect();
            }

            if let Err(e) = (self.callback)(&chunk) {
                callback_errors += 1;
                self.reporter.report(ReadoutError::Callback(e));
            }
            processed += 1;

            if let Some((history, capacity)) = &self.history {
                if let Ok(mut history) = history.lock() {
                    if history.len() >= *capacity {
                        history.pop_front();
                        if history_dropped == 0 {
                            warn!("History buffer full ({} chunks), dropping oldest", capacity);
                        }
                        history_dropped += 1;
                    }
                    history.push_back(chunk);
                }
            }
        }

        debug!(
            "FIFO worker finished: {} chunk(s), {} callback error(s), {} dropped from history",
            processed, callback_errors, history_dropped
        );
    }
}

fn watchdog(
    transport: Arc<dyn Transport>,
    channels: Vec<usize>,
    interval: Duration,
    stop: CancellationToken,
    reporter: Reporter,
    link_flags: Arc<AtomicU32>,
) {
    let mut violations = 0u64;
    while !stop.wait_timeout(interval) {
        match LinkStatus::read(transport.as_ref(), &channels) {
            Ok(status) => {
                let mut flags = 0;
                if status.sync.iter().any(|&ready| !ready) {
                    flags |= ERROR_RX_SYNC;
                }
                if status.decoder_errors.iter().any(|&count| count != 0) {
                    flags |= ERROR_8B10B;
                }
                if status.discarded.iter().any(|&count| count != 0) {
                    flags |= ERROR_FIFO_DISCARD;
                }
                link_flags.store(flags, Ordering::Relaxed);
                if let Some(violation) = status.first_violation() {
                    violations += 1;
                    reporter.report(violation.into());
                }
            }
            Err(e) => {
                reporter.report(e.into());
            }
        }
    }
    debug!("FIFO watchdog finished: {} violation(s)", violations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::ChipEmulator;

    fn settings(poll_ms: u64) -> ReadoutSettings {
        ReadoutSettings {
            poll_interval: Duration::from_millis(poll_ms),
            throughput_period: Duration::from_secs(1),
            rx_channels: vec![0, 1],
            history_capacity: 100,
        }
    }

    fn collecting_errback() -> (Errback, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let errback: Errback = Arc::new(move |err: ReadoutError| sink.lock().unwrap().push(format!("{err:?}")));
        (errback, errors)
    }

    fn collecting_callback() -> (Callback, Arc<Mutex<Vec<u32>>>) {
        let words = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&words);
        let callback: Callback = Box::new(move |chunk: &DataChunk| {
            sink.lock().unwrap().extend_from_slice(&chunk.words);
            Ok(())
        });
        (callback, words)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_throughput_window() {
        let mut window = ThroughputWindow::new(Duration::from_secs(1), Duration::from_millis(100));
        assert_eq!(window.capacity(), 10);
        window.record(0);
        assert_eq!(window.words_per_second(), None);
        for _ in 0..20 {
            window.record(50);
        }
        assert_eq!(window.words_per_second(), Some(500.0));
    }

    #[test]
    fn test_chunks_reach_callback_in_order() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(5));
        let (callback, words) = collecting_callback();
        let options = StartOptions {
            fill_buffer: true,
            ..StartOptions::default()
        };
        readout.start(callback, None, options).unwrap();
        assert_eq!(readout.state(), ReadoutState::Running);
        assert!(matches!(
            readout.start(Box::new(|_: &DataChunk| Ok(())), None, StartOptions::default()),
            Err(ReadoutError::AlreadyRunning)
        ));

        let expected: Vec<u32> = (0..1000).collect();
        for block in expected.chunks(100) {
            emulator.push_fifo(block);
            thread::sleep(Duration::from_millis(2));
        }
        readout.stop(Duration::from_secs(2)).unwrap();

        assert_eq!(readout.state(), ReadoutState::Idle);
        assert_eq!(*words.lock().unwrap(), expected);
        let history = readout.data_from_buffer();
        assert!(!history.is_empty());
        assert_eq!(history.iter().map(|chunk| chunk.words.len()).sum::<usize>(), 1000);
        assert!(history.iter().all(|chunk| chunk.timestamp_start <= chunk.timestamp_stop));
        // empty polls between chunks do not open gaps
        assert!(history
            .windows(2)
            .all(|pair| pair[1].timestamp_start == pair[0].timestamp_stop));
        assert!(readout.data_from_buffer().is_empty());
    }

    #[test]
    fn test_filter_and_converter() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(5));
        let (callback, words) = collecting_callback();
        let options = StartOptions {
            filter: Some(Arc::new(|word| word % 2 == 0)),
            converter: Some(Arc::new(|word| word * 10)),
            ..StartOptions::default()
        };
        readout.start(callback, None, options).unwrap();
        emulator.push_fifo(&[1, 2, 3, 4]);
        assert!(wait_for(|| words.lock().unwrap().len() == 2));
        readout.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(*words.lock().unwrap(), vec![20, 40]);
    }

    #[test]
    fn test_stop_timeout_reported_once() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(10));
        let (errback, errors) = collecting_errback();
        readout
            .start(Box::new(|_: &DataChunk| Ok(())), Some(errback), StartOptions::default())
            .unwrap();
        emulator.set_read_delay(Duration::from_millis(400));
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        readout.stop(Duration::from_millis(50)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(readout.state(), ReadoutState::Idle);
        assert!(!readout.is_running());

        let errors = errors.lock().unwrap();
        assert_eq!(errors.iter().filter(|err| err.contains("StopTimeout")).count(), 1);
    }

    #[test]
    fn test_failing_reads_stop_gracefully() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(5));
        let (errback, errors) = collecting_errback();
        emulator.fail_next_reads(1_000_000);
        readout
            .start(Box::new(|_: &DataChunk| Ok(())), Some(errback), StartOptions::default())
            .unwrap();
        assert!(wait_for(|| !errors.lock().unwrap().is_empty()));

        readout.stop(Duration::from_millis(300)).unwrap();
        assert_eq!(readout.state(), ReadoutState::Idle);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.iter().filter(|err| err.contains("StopTimeout")).count(), 0);
        assert!(errors.iter().any(|err| err.contains("Transport")));
    }

    #[test]
    fn test_stop_timeout_returned_without_errback() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(10));
        readout
            .start(Box::new(|_: &DataChunk| Ok(())), None, StartOptions::default())
            .unwrap();
        emulator.set_read_delay(Duration::from_millis(300));
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            readout.stop(Duration::from_millis(20)),
            Err(ReadoutError::Link(LinkError::StopTimeout(_)))
        ));
        assert!(matches!(readout.stop(Duration::from_millis(20)), Err(ReadoutError::NotRunning)));
    }

    #[test]
    fn test_words_per_second_unavailable_before_data() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(20));
        assert_eq!(readout.words_per_second(), None);
        readout
            .start(Box::new(|_: &DataChunk| Ok(())), None, StartOptions::default())
            .unwrap();

        let start = Instant::now();
        assert_eq!(readout.words_per_second(), None);
        assert!(start.elapsed() < Duration::from_millis(500));

        emulator.push_fifo(&[0; 64]);
        assert!(wait_for(|| readout.words_per_second().is_some_and(|rate| rate > 0.0)));
        readout.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_no_data_timeout_reported_once() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator, settings(5));
        let (errback, errors) = collecting_errback();
        let options = StartOptions {
            no_data_timeout: Some(Duration::from_millis(30)),
            ..StartOptions::default()
        };
        readout.start(Box::new(|_: &DataChunk| Ok(())), Some(errback), options).unwrap();
        thread::sleep(Duration::from_millis(300));
        readout.stop(Duration::from_secs(2)).unwrap();
        let errors = errors.lock().unwrap();
        assert_eq!(errors.iter().filter(|err| err.contains("NoDataTimeout")).count(), 1);
    }

    #[test]
    fn test_watchdog_and_callback_errors_reach_errback() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(2));
        let (errback, errors) = collecting_errback();
        emulator.set_rx_sync(1, false);
        readout
            .start(
                Box::new(|_: &DataChunk| Err(anyhow::anyhow!("sink full"))),
                Some(errback),
                StartOptions::default(),
            )
            .unwrap();
        emulator.push_fifo(&[7, 8, 9]);
        assert!(wait_for(|| {
            let errors = errors.lock().unwrap();
            errors.iter().any(|err| err.contains("RxSyncLost([1])"))
                && errors.iter().any(|err| err.contains("sink full"))
        }));
        readout.stop(Duration::from_secs(2)).unwrap();
        assert!(readout.log_link_status().is_some());
    }

    #[test]
    fn test_read_failure_without_errback_ends_session() {
        let emulator = Arc::new(ChipEmulator::fei4b().unwrap());
        let mut readout = FifoReadout::new(emulator.clone(), settings(5));
        emulator.fail_next_reads(1);
        readout
            .start(Box::new(|_: &DataChunk| Ok(())), None, StartOptions::default())
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            readout.stop(Duration::from_secs(2)),
            Err(ReadoutError::Transport(_))
        ));
        assert_eq!(readout.state(), ReadoutState::Idle);
    }
}
