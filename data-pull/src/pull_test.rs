use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWrite},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::sink::SinkHandle;

/// Writes the queued chunks one per call, then closes the input.
struct ChunkProducer {
    chunks: VecDeque<Bytes>,
    calls: Arc<AtomicUsize>,
    finalized: Arc<Mutex<Vec<bool>>>,
    delay: Option<Duration>,
}

impl ChunkProducer {
    fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into_iter().map(Bytes::from).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
            finalized: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Producer for ChunkProducer {
    async fn produce_more(&mut self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.chunks.pop_front() {
            Some(chunk) => {
                transfer.write_bytes(chunk);
            }
            None => transfer.close(),
        }
        Ok(())
    }

    fn finalize(&mut self, success: bool) {
        self.finalized.lock().unwrap().push(success);
    }
}

/// Writes `size` bytes per call forever, optionally capped by the session
/// maximum. Never closes the input.
struct EndlessProducer {
    size: usize,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl EndlessProducer {
    fn new(size: usize) -> Self {
        Self {
            size,
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }
}

impl Producer for EndlessProducer {
    async fn produce_more(&mut self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut size = self.size as u64;
        if let Some(remaining) = transfer.remaining() {
            size = size.min(remaining);
        }
        transfer.write(&vec![0x5a; size as usize]);
        Ok(())
    }
}

/// Accepts every write but the `fail_at`-th one, which fails.
struct FailingWriter {
    data: Arc<Mutex<Vec<u8>>>,
    writes: usize,
    fail_at: usize,
}

impl AsyncWrite for FailingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.writes += 1;
        if self.writes == self.fail_at {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")));
        }
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn reader_sink(name: &str, capacity: usize) -> (SinkHandle, JoinHandle<Vec<u8>>) {
    let (writer, mut reader) = tokio::io::duplex(capacity);
    let task = tokio::spawn(async move {
        let mut data = Vec::new();
        let _ = reader.read_to_end(&mut data).await;
        data
    });
    (SinkHandle::plain(name, writer), task)
}

async fn collect_events(rx: &mut broadcast::Receiver<PullEvent>) -> Vec<PullEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("event channel closed");
        let done = matches!(event, PullEvent::Completed(_));
        events.push(event);
        if done {
            return events;
        }
    }
}

fn sink_results(events: &[PullEvent]) -> Vec<(SinkId, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            PullEvent::SinkCompleted { sink, success, .. } => Some((*sink, *success)),
            _ => None,
        })
        .collect()
}

fn final_report(events: &[PullEvent]) -> PullReport {
    match events.last() {
        Some(PullEvent::Completed(report)) => report.clone(),
        other => panic!("expected a completion event, got {:?}", other),
    }
}

fn chunks(count: usize, size: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![i as u8; size]).collect()
}

#[tokio::test]
async fn test_fan_out_to_every_sink() -> anyhow::Result<()> {
    let input = chunks(5, 1000);
    let expected: Vec<u8> = input.concat();
    let producer = ChunkProducer::new(input);
    let finalized = Arc::clone(&producer.finalized);

    let pull = DataPull::new(PullConfig::new(2048), producer);
    let mut rx = pull.subscribe();
    let (a, a_data) = reader_sink("a", 512);
    let (b, b_data) = reader_sink("b", 512);
    let (a_id, b_id) = (a.id(), b.id());

    let report = pull.run(vec![a, b]).await?;
    assert!(report.success);
    assert_eq!(report.total_in, 5000);

    let events = collect_events(&mut rx).await;
    assert!(matches!(events.first(), Some(PullEvent::Started)));
    let mut results = sink_results(&events);
    results.sort();
    let mut want = vec![(a_id, true), (b_id, true)];
    want.sort();
    assert_eq!(results, want);
    assert!(final_report(&events).success);

    // Same bytes, same order, on every sink.
    assert_eq!(a_data.await?, expected);
    assert_eq!(b_data.await?, expected);
    assert_eq!(*finalized.lock().unwrap(), vec![true]);
    Ok(())
}

#[tokio::test]
async fn test_write_then_close_in_one_call() -> anyhow::Result<()> {
    struct WriteAndClose;

    impl Producer for WriteAndClose {
        async fn produce_more(&mut self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
            assert!(transfer.write(&[1u8; 60]));
            assert!(transfer.write(&[2u8; 40]));
            assert!(transfer.write(&[]));
            transfer.close();
            assert!(transfer.is_closed());
            Ok(())
        }
    }

    let pull = DataPull::new(PullConfig::default(), WriteAndClose);
    let mut rx = pull.subscribe();
    let (sink, data) = reader_sink("a", 4096);

    let report = pull.run(vec![sink]).await?;
    assert!(report.success);
    assert_eq!(report.total_in, 100);
    assert_eq!(data.await?, [vec![1u8; 60], vec![2u8; 40]].concat());

    let events = collect_events(&mut rx).await;
    assert_eq!(events.len(), 3);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_failed_sink_does_not_stop_the_others() -> anyhow::Result<()> {
    let input = chunks(5, 100);
    let expected: Vec<u8> = input.concat();
    let pull = DataPull::new(PullConfig::new(0), ChunkProducer::new(input.clone()));
    let mut rx = pull.subscribe();

    let failed = Arc::new(Mutex::new(Vec::new()));
    let a = SinkHandle::plain(
        "failing",
        FailingWriter {
            data: Arc::clone(&failed),
            writes: 0,
            fail_at: 3,
        },
    );
    let (b, b_data) = reader_sink("b", 4096);
    let (a_id, b_id) = (a.id(), b.id());

    pull.start(vec![a, b]).await?;
    let events = collect_events(&mut rx).await;

    let results = sink_results(&events);
    assert_eq!(results.len(), 2);
    assert!(results.contains(&(a_id, false)));
    assert!(results.contains(&(b_id, true)));
    let report = final_report(&events);
    assert!(report.success);
    assert_eq!(report.total_in, 500);

    // Nothing is written to a sink after its failure.
    assert_eq!(*failed.lock().unwrap(), [input[0].clone(), input[1].clone()].concat());
    assert_eq!(b_data.await?, expected);
    Ok(())
}

#[tokio::test]
async fn test_producer_failure_aborts_transfer() -> anyhow::Result<()> {
    struct FailOnSecondCall {
        calls: Arc<AtomicUsize>,
        finalized: Arc<Mutex<Vec<bool>>>,
    }

    impl Producer for FailOnSecondCall {
        async fn produce_more(&mut self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                transfer.write(b"hello");
                Ok(())
            } else {
                Err(anyhow::anyhow!("input device unplugged"))
            }
        }

        fn finalize(&mut self, success: bool) {
            self.finalized.lock().unwrap().push(success);
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(Mutex::new(Vec::new()));
    let pull = DataPull::new(
        PullConfig::new(10),
        FailOnSecondCall {
            calls: Arc::clone(&calls),
            finalized: Arc::clone(&finalized),
        },
    );
    let mut rx = pull.subscribe();
    let (a, _a_data) = reader_sink("a", 4096);
    let (b, _b_data) = reader_sink("b", 4096);

    pull.start(vec![a, b]).await?;
    let events = collect_events(&mut rx).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let results = sink_results(&events);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, success)| !success));
    let report = final_report(&events);
    assert!(!report.success);
    assert_eq!(report.total_in, 5);
    assert_eq!(*finalized.lock().unwrap(), vec![false]);
    Ok(())
}

#[tokio::test]
async fn test_stop_before_any_data() -> anyhow::Result<()> {
    struct Idle;

    impl Producer for Idle {
        async fn produce_more(&mut self, _transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    let pull = DataPull::new(PullConfig::default(), Idle);
    let mut rx = pull.subscribe();
    let (a, a_data) = reader_sink("a", 4096);
    let (b, b_data) = reader_sink("b", 4096);

    pull.start(vec![a, b]).await?;
    pull.stop().await?;
    let events = collect_events(&mut rx).await;

    let results = sink_results(&events);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, success)| !success));
    let report = final_report(&events);
    assert!(!report.success);
    assert_eq!(report.total_in, 0);
    assert!(a_data.await?.is_empty());
    assert!(b_data.await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_start_without_valid_sink() -> anyhow::Result<()> {
    let pull = DataPull::new(PullConfig::default(), ChunkProducer::new(chunks(1, 10)));
    let mut rx = pull.subscribe();
    assert!(pull.start(Vec::new()).await.is_err());
    assert!(rx.try_recv().is_err());
    assert!(!pull.is_started());

    // Handles claimed by a running session are invalid for any other one.
    let first = DataPull::new(
        PullConfig::default(),
        ChunkProducer::new(chunks(1, 10)).with_delay(Duration::from_millis(50)),
    );
    let (sink, _data) = reader_sink("a", 4096);
    first.start(vec![sink.clone()]).await?;
    assert!(!sink.is_valid());

    let second = DataPull::new(PullConfig::default(), ChunkProducer::new(chunks(1, 10)));
    let mut rx = second.subscribe();
    assert!(second.start(vec![sink.clone(), sink.clone()]).await.is_err());
    assert!(rx.try_recv().is_err());

    // Sessions are single-use.
    assert!(first.start(Vec::new()).await.is_err());
    assert!(first.wait().await?.success);
    assert!(first.start(vec![reader_sink("b", 16).0]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_initialize_failure_cancels_start() -> anyhow::Result<()> {
    struct Broken;

    impl Producer for Broken {
        async fn initialize(&mut self) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("device busy"))
        }

        async fn produce_more(&mut self, _transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
            unreachable!("never started")
        }
    }

    let pull = DataPull::new(PullConfig::default(), Broken);
    let mut rx = pull.subscribe();
    let (sink, data) = reader_sink("a", 4096);
    let err = pull.start(vec![sink.clone()]).await.unwrap_err();
    assert!(format!("{:#}", err).contains("device busy"));
    assert!(rx.try_recv().is_err());
    assert!(!pull.is_started());

    // The sink is left untouched for another session.
    assert!(sink.is_valid());
    let retry = DataPull::new(PullConfig::default(), ChunkProducer::new(chunks(2, 10)));
    let report = retry.run(vec![sink]).await?;
    assert!(report.success);
    assert_eq!(data.await?, chunks(2, 10).concat());
    Ok(())
}

#[tokio::test]
async fn test_backpressure_holds_the_producer() -> anyhow::Result<()> {
    let producer = EndlessProducer::new(64);
    let calls = Arc::clone(&producer.calls);
    let pull = DataPull::new(PullConfig::new(16), producer);
    let mut rx = pull.subscribe();

    let (writer, mut reader) = tokio::io::duplex(64);
    pull.start(vec![SinkHandle::plain("slow", writer)]).await?;

    // First chunk fills the pipe, second one is stuck in the writer.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let drain = tokio::spawn(async move {
        let mut data = Vec::new();
        let _ = reader.read_to_end(&mut data).await;
        data
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.load(Ordering::SeqCst) > 2);

    pull.stop().await?;
    let events = collect_events(&mut rx).await;
    assert!(!final_report(&events).success);
    assert!(drain.await?.len() >= 128);
    Ok(())
}

#[tokio::test]
async fn test_progress_reports() -> anyhow::Result<()> {
    let config = PullConfig::default()
        .with_progress_interval(100)
        .with_progress_max_hint(500);
    let pull = DataPull::new(config, ChunkProducer::new(chunks(10, 50)));
    let mut rx = pull.subscribe();
    let (sink, _data) = reader_sink("a", 4096);

    pull.start(vec![sink]).await?;
    let events = collect_events(&mut rx).await;

    let progress: Vec<(u64, Option<u64>)> = events
        .iter()
        .filter_map(|event| match event {
            PullEvent::Progress { total_in, max_hint } => Some((*total_in, *max_hint)),
            _ => None,
        })
        .collect();
    let want: Vec<(u64, Option<u64>)> = (1..=5).map(|i| (i * 100, Some(500))).collect();
    assert_eq!(progress, want);
    assert!(final_report(&events).success);
    Ok(())
}

#[tokio::test]
async fn test_max_in_closes_transfer() -> anyhow::Result<()> {
    let pull = DataPull::new(PullConfig::default().with_max_in(100), EndlessProducer::new(30));
    let (a, a_data) = reader_sink("a", 4096);
    let (b, b_data) = reader_sink("b", 4096);

    let report = pull.run(vec![a, b]).await?;
    assert!(report.success);
    assert_eq!(report.total_in, 100);
    assert_eq!(a_data.await?.len(), 100);
    assert_eq!(b_data.await?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn test_close_from_outside() -> anyhow::Result<()> {
    let mut producer = EndlessProducer::new(10);
    producer.delay = Some(Duration::from_millis(2));
    let pull = DataPull::new(PullConfig::default(), producer);
    let (sink, data) = reader_sink("a", 4096);

    pull.start(vec![sink]).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    pull.close().await?;

    let report = pull.wait().await?;
    assert!(report.success);
    assert_eq!(data.await?.len() as u64, report.total_in);
    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent() -> anyhow::Result<()> {
    let mut producer = EndlessProducer::new(10);
    producer.delay = Some(Duration::from_millis(2));
    let pull = DataPull::new(PullConfig::default(), producer);
    let mut rx = pull.subscribe();
    let (a, _a_data) = reader_sink("a", 4096);
    let (b, _b_data) = reader_sink("b", 4096);

    pull.start(vec![a, b]).await?;
    pull.stop().await?;
    pull.stop().await?;
    let events = collect_events(&mut rx).await;
    assert_eq!(sink_results(&events).len(), 2);
    assert!(!final_report(&events).success);

    // Nothing more once completed.
    pull.stop().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_stop_before_start_is_ignored() -> anyhow::Result<()> {
    let pull = DataPull::new(PullConfig::default(), ChunkProducer::new(chunks(3, 10)));
    pull.stop().await?;
    let (sink, data) = reader_sink("a", 4096);

    let report = pull.run(vec![sink]).await?;
    assert!(report.success);
    assert_eq!(data.await?.len(), 30);
    Ok(())
}

#[tokio::test]
async fn test_stop_single_sink() -> anyhow::Result<()> {
    let producer = ChunkProducer::new(chunks(20, 10)).with_delay(Duration::from_millis(2));
    let pull = DataPull::new(PullConfig::default(), producer);
    let mut rx = pull.subscribe();
    let (a, _a_data) = reader_sink("a", 4096);
    let (b, b_data) = reader_sink("b", 4096);
    let (a_id, b_id) = (a.id(), b.id());

    pull.start(vec![a, b]).await?;
    pull.stop_sink(a_id).await?;
    let events = collect_events(&mut rx).await;

    let results = sink_results(&events);
    assert_eq!(results, vec![(a_id, false), (b_id, true)]);
    assert!(final_report(&events).success);
    assert_eq!(b_data.await?.len(), 200);
    Ok(())
}

#[tokio::test]
async fn test_drop_while_running_reports_failure() -> anyhow::Result<()> {
    let mut producer = EndlessProducer::new(10);
    producer.delay = Some(Duration::from_millis(5));
    let pull = DataPull::new(PullConfig::default(), producer);
    let mut rx = pull.subscribe();
    let (a, a_data) = reader_sink("a", 4096);
    let (b, b_data) = reader_sink("b", 4096);

    pull.start(vec![a, b]).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(pull);

    let events = collect_events(&mut rx).await;
    let results = sink_results(&events);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, success)| !success));
    assert!(!final_report(&events).success);

    // Writers are cancelled, readers see end of stream.
    a_data.await?;
    b_data.await?;
    Ok(())
}

#[tokio::test]
async fn test_event_stream() -> anyhow::Result<()> {
    use futures::StreamExt;

    let pull = DataPull::new(PullConfig::default(), ChunkProducer::new(chunks(3, 10)));
    let mut events = pull.events();
    let (sink, _data) = reader_sink("a", 4096);
    pull.start(vec![sink]).await?;

    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let done = matches!(event, PullEvent::Completed(_));
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(matches!(seen.first(), Some(PullEvent::Started)));
    assert!(matches!(
        seen.get(1),
        Some(PullEvent::SinkCompleted { success: true, name, .. }) if &**name == "a"
    ));
    Ok(())
}

#[tokio::test]
async fn test_nested_pass_is_dismissed() {
    let (events, _) = broadcast::channel(16);
    let (notices, mut notice_rx) = mpsc::unbounded_channel();
    let (report, _) = tokio::sync::watch::channel(None);
    let producer = ChunkProducer::new(chunks(1, 10));
    let calls = Arc::clone(&producer.calls);

    let mut session = Session {
        producer,
        state: PullState::new(
            PullConfig::default(),
            events,
            notices,
            CancellationToken::new(),
            Arc::new(Mutex::new(Vec::new())),
        ),
        report,
        started: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        stopped: CancellationToken::new(),
    };

    // A pass already in progress dismisses the nested one.
    session.state.depth = 1;
    session.evaluate().await;
    assert!(session.state.pass_dismissed);
    assert_eq!(session.state.depth, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(notice_rx.try_recv().is_err());

    // Depth is restored after a pass that ran.
    session.state.depth = 0;
    session.evaluate().await;
    assert_eq!(session.state.depth, 0);
}
