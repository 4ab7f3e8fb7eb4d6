//! Event Bus - 세션별 이벤트 팬아웃
//!
//! 세션 ID로 옵저버를 등록/해제하고, 해당 세션의 모든 옵저버에게
//! 발행 순서대로 이벤트를 전달합니다.
//!
//! - 발행은 fire-and-forget: 구독자가 없으면 버림 (버퍼링/재생 없음)
//! - 옵저버마다 전용 큐 + 전달 워커: 느린 옵저버가 다른 옵저버나 발행자를 막지 않음
//! - 전달 실패, 타임아웃, 큐 초과 시 해당 옵저버만 제거 (재시도 없음)

use super::types::StreamEvent;
use crate::core::SessionId;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

// ============================================================================
// Observer Trait
// ============================================================================

/// 옵저버 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// 이벤트 수신자
///
/// 전송 계층(WebSocket 등)과 무관한 추상화입니다.
#[async_trait]
pub trait Observer: Send + Sync {
    /// 옵저버 이름 (디버깅용)
    fn name(&self) -> &str;

    /// 이벤트 전달. 실패하면 버스에서 제거됩니다.
    async fn deliver(&self, event: &StreamEvent) -> Result<(), TransportError>;

    /// 전달 실패나 큐 초과로 버스가 옵저버를 제거할 때 호출
    ///
    /// unsubscribe로 해제될 때는 호출되지 않습니다.
    fn on_dropped(&self, _reason: &TransportError) {}
}

/// 구독 핸들 (해제 시 사용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub session_id: SessionId,
    pub observer_id: ObserverId,
}

// ============================================================================
// ChannelObserver
// ============================================================================

/// mpsc 채널로 이벤트를 넘기는 프로세스 내부 옵저버
pub struct ChannelObserver {
    name: String,
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelObserver {
    /// 옵저버와 수신 채널 생성
    pub fn pair(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                name: name.into(),
                tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl Observer for ChannelObserver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &StreamEvent) -> Result<(), TransportError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| TransportError::Closed)
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// 이벤트 버스 설정
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 옵저버별 전달 타임아웃
    pub send_timeout: Duration,

    /// 옵저버별 대기 큐 크기 (초과 시 옵저버 제거)
    pub observer_queue: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            observer_queue: 256,
        }
    }
}

/// 등록된 옵저버
struct Subscription {
    id: ObserverId,
    name: String,
    observer: Arc<dyn Observer>,
    queue: mpsc::Sender<StreamEvent>,
    worker: JoinHandle<()>,
}

impl Subscription {
    fn is_alive(&self) -> bool {
        !self.queue.is_closed()
    }
}

type SessionObservers = Arc<Mutex<Vec<Subscription>>>;

/// 세션별 이벤트 버스
///
/// ## 사용법
///
/// ```ignore
/// let bus = EventBus::new();
/// let (observer, mut rx) = ChannelObserver::pair("ui", 64);
/// let handle = bus.subscribe(session_id, observer).await;
///
/// bus.publish(StreamEvent::session_start(session_id, "demo")).await;
/// let event = rx.recv().await;
///
/// bus.unsubscribe(&handle).await;
/// ```
pub struct EventBus {
    config: EventBusConfig,

    /// 세션 → 옵저버 목록 (세션마다 독립 잠금)
    sessions: RwLock<HashMap<SessionId, SessionObservers>>,

    observer_counter: AtomicU64,
    published: AtomicU64,
    dropped_observers: Arc<AtomicU64>,
}

impl EventBus {
    /// 기본 설정으로 이벤트 버스 생성
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// 커스텀 설정으로 이벤트 버스 생성
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            observer_counter: AtomicU64::new(0),
            published: AtomicU64::new(0),
            dropped_observers: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// 옵저버 등록
    ///
    /// 등록 이후에 발행된 이벤트만 받습니다.
    pub async fn subscribe(
        &self,
        session_id: SessionId,
        observer: Arc<dyn Observer>,
    ) -> SubscriptionHandle {
        let id = ObserverId(self.observer_counter.fetch_add(1, Ordering::SeqCst));
        let name = observer.name().to_string();
        let (queue, rx) = mpsc::channel(self.config.observer_queue.max(1));

        let worker = tokio::spawn(deliver_loop(
            session_id,
            id,
            Arc::clone(&observer),
            rx,
            self.config.send_timeout,
            Arc::clone(&self.dropped_observers),
        ));

        debug!(
            session_id = %session_id,
            observer_id = %id,
            observer_name = %name,
            "Registering observer"
        );

        // 맵 잠금을 쥔 채 등록해야 remove_if_empty가 빈 슬롯으로 오인하지 않음
        let mut sessions = self.sessions.write().await;
        let slot = Arc::clone(sessions.entry(session_id).or_default());
        slot.lock().await.push(Subscription {
            id,
            name,
            observer,
            queue,
            worker,
        });
        drop(sessions);

        SubscriptionHandle {
            session_id,
            observer_id: id,
        }
    }

    /// 옵저버 해제
    ///
    /// 반환 이후 발행된 이벤트는 이 옵저버에게 전달되지 않습니다.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(slot) = self.slot(handle.session_id).await else {
            return false;
        };

        let (removed, now_empty) = {
            let mut observers = slot.lock().await;
            let before = observers.len();
            // 큐 송신자를 drop하면 워커는 남은 이벤트를 비우고 종료
            observers.retain(|s| s.id != handle.observer_id);
            (observers.len() != before, observers.is_empty())
        };

        if now_empty {
            self.remove_if_empty(handle.session_id).await;
        }

        if removed {
            debug!(
                session_id = %handle.session_id,
                observer_id = %handle.observer_id,
                "Unregistered observer"
            );
        }
        removed
    }

    /// 이벤트 발행
    ///
    /// 옵저버 I/O를 기다리지 않습니다. 구독자가 없으면 조용히 버립니다.
    pub async fn publish(&self, event: StreamEvent) {
        let seq = self.published.fetch_add(1, Ordering::SeqCst);
        let session_id = event.session_id;

        let Some(slot) = self.slot(session_id).await else {
            trace!(session_id = %session_id, event_type = %event.event_type, "No observers, dropping event");
            return;
        };

        let now_empty = {
            // 세션 잠금 안에서 enqueue → 모든 옵저버가 같은 순서로 수신
            let mut observers = slot.lock().await;
            observers.retain(|sub| {
                if !sub.is_alive() {
                    debug!(observer_id = %sub.id, observer_name = %sub.name, "Pruning dead observer");
                    return false;
                }
                match sub.queue.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            session_id = %session_id,
                            observer_id = %sub.id,
                            observer_name = %sub.name,
                            "Observer queue full, dropping observer"
                        );
                        sub.worker.abort();
                        self.dropped_observers.fetch_add(1, Ordering::SeqCst);
                        sub.observer.on_dropped(&TransportError::Overflow);
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
            observers.is_empty()
        };

        trace!(
            session_id = %session_id,
            event_type = %event.event_type,
            "Published event #{}", seq + 1
        );

        if now_empty {
            self.remove_if_empty(session_id).await;
        }
    }

    /// 세션의 살아있는 옵저버 수
    pub async fn observer_count(&self, session_id: SessionId) -> usize {
        match self.slot(session_id).await {
            Some(slot) => slot.lock().await.iter().filter(|s| s.is_alive()).count(),
            None => 0,
        }
    }

    /// 옵저버가 등록된 세션 수
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 총 발행된 이벤트 수
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// 실패로 제거된 옵저버 수
    pub fn dropped_count(&self) -> u64 {
        self.dropped_observers.load(Ordering::SeqCst)
    }

    /// 모든 구독 해제 (종료 처리)
    pub async fn close(&self) {
        let drained: Vec<SessionObservers> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            for sub in slot.lock().await.drain(..) {
                sub.worker.abort();
            }
        }
        debug!("Event bus closed");
    }

    async fn slot(&self, session_id: SessionId) -> Option<SessionObservers> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    async fn remove_if_empty(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        // subscribe가 끼어들었을 수 있으므로 다시 확인
        let empty = sessions
            .get(&session_id)
            .map(|slot| slot.try_lock().map(|o| o.is_empty()).unwrap_or(false))
            .unwrap_or(false);
        if empty {
            sessions.remove(&session_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 옵저버 하나의 전달 루프
async fn deliver_loop(
    session_id: SessionId,
    id: ObserverId,
    observer: Arc<dyn Observer>,
    mut rx: mpsc::Receiver<StreamEvent>,
    send_timeout: Duration,
    dropped: Arc<AtomicU64>,
) {
    while let Some(event) = rx.recv().await {
        let failure = match tokio::time::timeout(send_timeout, observer.deliver(&event)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout(send_timeout.as_millis() as u64),
        };

        warn!(
            session_id = %session_id,
            observer_id = %id,
            observer_name = observer.name(),
            error = %failure,
            "Observer delivery failed, dropping observer"
        );
        dropped.fetch_add(1, Ordering::SeqCst);
        observer.on_dropped(&failure);
        // rx drop → 다음 publish에서 정리
        return;
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::StreamEventType;
    use tokio::time::timeout;

    struct SlowObserver {
        delay: Duration,
    }

    #[async_trait]
    impl Observer for SlowObserver {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&self, _event: &StreamEvent) -> Result<(), TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    struct BrokenObserver;

    #[async_trait]
    impl Observer for BrokenObserver {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _event: &StreamEvent) -> Result<(), TransportError> {
            Err(TransportError::Io("connection reset".into()))
        }
    }

    fn log(session: SessionId, msg: &str) -> StreamEvent {
        StreamEvent::log_line(session, None, "info", msg)
    }

    async fn recv(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_fan_out_to_all_observers() {
        let bus = EventBus::new();
        let session = SessionId::new();

        let mut receivers = Vec::new();
        for i in 0..3 {
            let (observer, rx) = ChannelObserver::pair(format!("obs-{}", i), 16);
            bus.subscribe(session, observer).await;
            receivers.push(rx);
        }
        assert_eq!(bus.observer_count(session).await, 3);

        bus.publish(log(session, "hello")).await;

        for rx in receivers.iter_mut() {
            let event = recv(rx).await;
            assert_eq!(event.event_type, StreamEventType::LogLine);
            assert_eq!(event.data["message"], "hello");
        }
    }

    #[tokio::test]
    async fn test_order_is_preserved_per_session() {
        let bus = EventBus::new();
        let session = SessionId::new();
        let (a, mut rx_a) = ChannelObserver::pair("a", 64);
        let (b, mut rx_b) = ChannelObserver::pair("b", 64);
        bus.subscribe(session, a).await;
        bus.subscribe(session, b).await;

        for i in 0..20 {
            bus.publish(log(session, &i.to_string())).await;
        }

        for i in 0..20 {
            assert_eq!(recv(&mut rx_a).await.data["message"], i.to_string());
            assert_eq!(recv(&mut rx_b).await.data["message"], i.to_string());
        }
    }

    #[tokio::test]
    async fn test_no_subscribers_and_no_replay() {
        let bus = EventBus::new();
        let session = SessionId::new();

        // 구독자 없음 → 에러 없이 버림
        bus.publish(log(session, "lost")).await;
        assert_eq!(bus.published_count(), 1);

        let (late, mut rx) = ChannelObserver::pair("late", 8);
        bus.subscribe(session, late).await;
        bus.publish(log(session, "seen")).await;

        assert_eq!(recv(&mut rx).await.data["message"], "seen");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_observer_gets_nothing_after() {
        let bus = EventBus::new();
        let session = SessionId::new();
        let (stay, mut rx_stay) = ChannelObserver::pair("stay", 8);
        let (leave, mut rx_leave) = ChannelObserver::pair("leave", 8);
        bus.subscribe(session, stay).await;
        let handle = bus.subscribe(session, leave).await;

        bus.publish(log(session, "before")).await;
        assert!(bus.unsubscribe(&handle).await);
        assert!(!bus.unsubscribe(&handle).await);
        bus.publish(log(session, "after")).await;

        assert_eq!(recv(&mut rx_leave).await.data["message"], "before");
        assert!(timeout(Duration::from_millis(100), rx_leave.recv())
            .await
            .map(|e| e.is_none())
            .unwrap_or(true));

        assert_eq!(recv(&mut rx_stay).await.data["message"], "before");
        assert_eq!(recv(&mut rx_stay).await.data["message"], "after");
    }

    #[tokio::test]
    async fn test_slow_observer_is_isolated_and_dropped() {
        let bus = EventBus::with_config(EventBusConfig {
            send_timeout: Duration::from_millis(50),
            observer_queue: 16,
        });
        let session = SessionId::new();
        bus.subscribe(
            session,
            Arc::new(SlowObserver {
                delay: Duration::from_secs(10),
            }),
        )
        .await;
        let (fast, mut rx) = ChannelObserver::pair("fast", 16);
        bus.subscribe(session, fast).await;

        bus.publish(log(session, "one")).await;
        assert_eq!(recv(&mut rx).await.data["message"], "one");

        tokio::time::sleep(Duration::from_millis(200)).await;
        bus.publish(log(session, "two")).await;
        assert_eq!(recv(&mut rx).await.data["message"], "two");

        assert_eq!(bus.observer_count(session).await, 1);
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_observer_is_removed() {
        let bus = EventBus::new();
        let session = SessionId::new();
        bus.subscribe(session, Arc::new(BrokenObserver)).await;

        bus.publish(log(session, "x")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bus.observer_count(session).await, 0);
        bus.publish(log(session, "y")).await;
        assert_eq!(bus.session_count().await, 0);
    }

    /// 제거 통지를 기록하는 옵저버
    struct NotifiedObserver {
        delay: Duration,
        dropped: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Observer for NotifiedObserver {
        fn name(&self) -> &str {
            "notified"
        }

        async fn deliver(&self, _event: &StreamEvent) -> Result<(), TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        fn on_dropped(&self, reason: &TransportError) {
            self.dropped.lock().unwrap().push(reason.to_string());
        }
    }

    #[tokio::test]
    async fn test_dropped_observer_is_notified() {
        let bus = EventBus::with_config(EventBusConfig {
            send_timeout: Duration::from_millis(50),
            observer_queue: 1,
        });

        // 타임아웃
        let session = SessionId::new();
        let slow = Arc::new(NotifiedObserver {
            delay: Duration::from_secs(10),
            dropped: Default::default(),
        });
        bus.subscribe(session, slow.clone()).await;
        bus.publish(log(session, "one")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slow.dropped.lock().unwrap().len(), 1);
        assert!(slow.dropped.lock().unwrap()[0].contains("timed out"));

        // 큐 초과: 워커가 돌기 전에 연속 발행
        let other = SessionId::new();
        let stalled = Arc::new(NotifiedObserver {
            delay: Duration::from_secs(10),
            dropped: Default::default(),
        });
        bus.subscribe(other, stalled.clone()).await;
        for i in 0..8 {
            bus.publish(log(other, &i.to_string())).await;
        }
        assert_eq!(
            stalled.dropped.lock().unwrap().as_slice(),
            ["observer queue full".to_string()]
        );
        assert_eq!(bus.observer_count(other).await, 0);

        // 정상 해제는 통지하지 않음
        let quiet = Arc::new(NotifiedObserver {
            delay: Duration::ZERO,
            dropped: Default::default(),
        });
        let handle = bus.subscribe(other, quiet.clone()).await;
        assert!(bus.unsubscribe(&handle).await);
        assert!(quiet.dropped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let bus = EventBus::new();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let (o1, mut rx1) = ChannelObserver::pair("s1", 8);
        let (o2, mut rx2) = ChannelObserver::pair("s2", 8);
        bus.subscribe(s1, o1).await;
        bus.subscribe(s2, o2).await;

        bus.publish(log(s1, "for-s1")).await;

        assert_eq!(recv(&mut rx1).await.data["message"], "for-s1");
        assert!(timeout(Duration::from_millis(50), rx2.recv()).await.is_err());

        bus.close().await;
        assert_eq!(bus.session_count().await, 0);
    }
}
