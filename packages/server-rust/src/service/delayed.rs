//! Long-poll requests parked until their config changes or they time out.
//!
//! Each parked request is a [`DelayedEntry`] with a one-shot claim flag.
//! Whoever wins the claim (the timer, a reload drain, a task re-checking
//! the generation, or shutdown) gets the request and is the only party that
//! may answer it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfgsync_core::{ApplicationId, GetConfigResponse, TenantName};
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::request::{ConfigRequest, TRACE_LEVEL};

/// A parked request and what it resolved to when it was parked.
#[derive(Debug)]
pub struct DelayedConfigResponse {
    pub request: ConfigRequest,
    pub application: ApplicationId,
    /// Response sent if nothing changes before the timeout.
    pub unchanged: GetConfigResponse,
}

impl DelayedConfigResponse {
    fn respond_unchanged(self) {
        let Self {
            mut request,
            unchanged,
            ..
        } = self;
        if !request.is_connection_valid() {
            debug!(host = request.hostname(), "Client gone before timeout, not responding");
            request.abandon();
            return;
        }
        request.trace(TRACE_LEVEL, "Timeout reached, returning unchanged config");
        request.respond(unchanged);
    }
}

/// One parked request.
#[derive(Debug)]
pub struct DelayedEntry {
    id: u64,
    application: ApplicationId,
    cancelled: AtomicBool,
    payload: parking_lot::Mutex<Option<DelayedConfigResponse>>,
    timer: parking_lot::Mutex<Option<AbortHandle>>,
}

impl DelayedEntry {
    #[must_use]
    pub fn application(&self) -> &ApplicationId {
        &self.application
    }

    /// Claims the entry. Returns `true` for exactly one caller.
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn claim(&self) -> Option<DelayedConfigResponse> {
        if self.cancel() {
            self.payload.lock().take()
        } else {
            None
        }
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

/// All parked requests, grouped by application.
#[derive(Debug, Default)]
pub struct DelayedResponses {
    queues: DashMap<ApplicationId, BTreeMap<u64, Arc<DelayedEntry>>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl DelayedResponses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `response` and arms a timer answering it with the unchanged
    /// config after `timeout`.
    pub fn delay(
        self: &Arc<Self>,
        response: DelayedConfigResponse,
        timeout: Duration,
    ) -> Arc<DelayedEntry> {
        let application = response.application.clone();
        let entry = Arc::new(DelayedEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            application: application.clone(),
            cancelled: AtomicBool::new(false),
            payload: parking_lot::Mutex::new(Some(response)),
            timer: parking_lot::Mutex::new(None),
        });

        self.queues
            .entry(application)
            .or_default()
            .insert(entry.id, Arc::clone(&entry));

        if self.stopped.load(Ordering::SeqCst) {
            if let Some(parked) = self.reclaim(&entry) {
                parked.request.abandon();
            }
            return entry;
        }

        self.arm_timer(&entry, timeout);
        self.record_size();
        entry
    }

    /// Spawns the timeout of `entry`. The entry is already visible to drains
    /// here; one claimed before the handle is stored found no timer to stop,
    /// so the timer is aborted on the spot.
    fn arm_timer(self: &Arc<Self>, entry: &Arc<DelayedEntry>, timeout: Duration) {
        let queue = Arc::clone(self);
        let timed = Arc::clone(entry);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.expire(&timed);
        });
        *entry.timer.lock() = Some(timer.abort_handle());
        if entry.is_cancelled() {
            entry.stop_timer();
        }
    }

    /// Claims `entry` and takes it out of the queue. `None` if someone else
    /// claimed it first.
    pub fn reclaim(&self, entry: &DelayedEntry) -> Option<DelayedConfigResponse> {
        let parked = entry.claim()?;
        entry.stop_timer();
        self.unlink(entry);
        Some(parked)
    }

    /// Claims every request parked for `application`, and for the global
    /// application unless `application` is global itself.
    pub fn drain(&self, application: &ApplicationId) -> Vec<DelayedConfigResponse> {
        let mut drained = self.take_queue(application);
        if !application.is_global() {
            drained.extend(self.take_queue(&ApplicationId::global()));
        }
        self.record_size();
        drained
    }

    /// Claims every request parked for any application of `tenant`.
    pub fn drain_tenant(&self, tenant: &TenantName) -> Vec<DelayedConfigResponse> {
        let applications: Vec<ApplicationId> = self
            .queues
            .iter()
            .filter(|e| e.key().tenant == *tenant)
            .map(|e| e.key().clone())
            .collect();
        let drained = applications
            .iter()
            .flat_map(|application| self.take_queue(application))
            .collect();
        self.record_size();
        drained
    }

    /// Number of parked requests.
    #[must_use]
    pub fn size(&self) -> usize {
        self.queues.iter().map(|e| e.value().len()).sum()
    }

    /// Drops every parked request without answering and disarms all timers.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let applications: Vec<ApplicationId> =
            self.queues.iter().map(|e| e.key().clone()).collect();
        let mut dropped = 0;
        for application in &applications {
            for parked in self.take_queue(application) {
                parked.request.abandon();
                dropped += 1;
            }
        }
        self.record_size();
        info!(dropped, "Delayed responses stopped");
    }

    fn expire(&self, entry: &DelayedEntry) {
        if let Some(parked) = entry.claim() {
            self.unlink(entry);
            self.record_size();
            parked.respond_unchanged();
        }
    }

    fn take_queue(&self, application: &ApplicationId) -> Vec<DelayedConfigResponse> {
        let Some((_, entries)) = self.queues.remove(application) else {
            return Vec::new();
        };
        entries
            .into_values()
            .filter_map(|entry| {
                let parked = entry.claim()?;
                entry.stop_timer();
                Some(parked)
            })
            .collect()
    }

    fn unlink(&self, entry: &DelayedEntry) {
        let now_empty = match self.queues.get_mut(&entry.application) {
            Some(mut queue) => {
                queue.remove(&entry.id);
                queue.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.queues.remove_if(&entry.application, |_, queue| queue.is_empty());
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_size(&self) {
        metrics::gauge!("cfgsync_delayed_responses").set(self.size() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use cfgsync_core::ReplyBody;

    use super::*;
    use crate::network::{ConnectionConfig, ConnectionRegistry, OutboundMessage};
    use crate::service::testkit::{
        app, assert_no_reply, config_of, config_request, connection, get_config, next_reply,
        response,
    };

    fn parked(
        conn: &Arc<crate::network::ConnectionHandle>,
        id: u64,
        application: &ApplicationId,
    ) -> DelayedConfigResponse {
        DelayedConfigResponse {
            request: config_request(conn, id, get_config("host1", 5, "fp5", 10_000)),
            application: application.clone(),
            unchanged: response(5, "fp5"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_answers_with_unchanged_config_once() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, mut rx) = connection();
        let application = app("t1", "a");

        queue.delay(parked(&conn, 1, &application), Duration::from_secs(10));
        assert_eq!(queue.size(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let (id, body) = next_reply(&mut rx).await;
        assert_eq!(id, 1);
        let config = config_of(body);
        assert_eq!(config.generation, 5);
        assert_eq!(config.payload_fingerprint, "fp5");
        assert_eq!(queue.size(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_no_reply(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_entry_is_not_answered_by_timer() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, mut rx) = connection();
        let application = app("t1", "a");

        let entry = queue.delay(parked(&conn, 1, &application), Duration::from_secs(10));
        let drained = queue.drain(&application);
        assert_eq!(drained.len(), 1);
        assert!(entry.is_cancelled());
        assert_eq!(queue.size(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_no_reply(&mut rx);
        for parked in drained {
            parked.request.abandon();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_includes_global_entries() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, _rx) = connection();
        let a = app("t1", "a");
        let b = app("t1", "b");

        queue.delay(parked(&conn, 1, &a), Duration::from_secs(10));
        queue.delay(parked(&conn, 2, &b), Duration::from_secs(10));
        queue.delay(parked(&conn, 3, &ApplicationId::global()), Duration::from_secs(10));

        let drained = queue.drain(&a);
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().any(|p| p.application.is_global()));
        assert_eq!(queue.size(), 1);
        drained.into_iter().for_each(|p| p.request.abandon());

        queue.delay(parked(&conn, 4, &ApplicationId::global()), Duration::from_secs(10));
        let global = queue.drain(&ApplicationId::global());
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].application, ApplicationId::global());
        global.into_iter().for_each(|p| p.request.abandon());
        assert_eq!(queue.size(), 1);
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_tenant_only_touches_that_tenant() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, _rx) = connection();

        queue.delay(parked(&conn, 1, &app("t1", "a")), Duration::from_secs(10));
        queue.delay(parked(&conn, 2, &app("t1", "b")), Duration::from_secs(10));
        queue.delay(parked(&conn, 3, &app("t2", "a")), Duration::from_secs(10));

        let drained = queue.drain_tenant(&TenantName::new("t1"));
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.size(), 1);
        drained.into_iter().for_each(|p| p.request.abandon());
        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_wins_only_once() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, mut rx) = connection();
        let application = app("t1", "a");

        let entry = queue.delay(parked(&conn, 1, &application), Duration::from_secs(10));
        let parked = queue.reclaim(&entry).unwrap();
        assert!(queue.reclaim(&entry).is_none());
        assert!(queue.drain(&application).is_empty());
        parked.request.abandon();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_no_reply(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drops_everything_without_answering() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, mut rx) = connection();

        queue.delay(parked(&conn, 1, &app("t1", "a")), Duration::from_secs(10));
        queue.delay(parked(&conn, 2, &app("t2", "b")), Duration::from_secs(10));
        queue.stop();
        assert_eq!(queue.size(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_no_reply(&mut rx);

        let late = queue.delay(parked(&conn, 3, &app("t1", "a")), Duration::from_secs(1));
        assert!(late.is_cancelled());
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_for_disconnected_client_is_silent() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, mut rx) = connection();
        queue.delay(parked(&conn, 1, &app("t1", "a")), Duration::from_secs(1));
        conn.close("client went away");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_no_reply(&mut rx);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_armed_after_claim_is_aborted() {
        let queue = Arc::new(DelayedResponses::new());
        let (conn, mut rx) = connection();
        let entry = Arc::new(DelayedEntry {
            id: 0,
            application: app("t1", "a"),
            cancelled: AtomicBool::new(false),
            payload: parking_lot::Mutex::new(Some(parked(&conn, 1, &app("t1", "a")))),
            timer: parking_lot::Mutex::new(None),
        });

        // A drain claims the entry before its timer exists.
        let claimed = entry.claim().unwrap();
        entry.stop_timer();
        queue.arm_timer(&entry, Duration::from_secs(3600));
        assert!(entry.timer.lock().is_none());

        for _ in 0..10 {
            if Arc::strong_count(&entry) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&entry), 1);
        assert_eq!(Arc::strong_count(&queue), 1);
        claimed.request.abandon();
        assert_no_reply(&mut rx);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timers_and_drains_answer_each_entry_once() {
        const ENTRIES: u64 = 200;

        for round in 0..20 {
            let queue = Arc::new(DelayedResponses::new());
            let (conn, mut rx) = ConnectionRegistry::new().register(
                "client",
                &ConnectionConfig {
                    outbound_channel_capacity: 1024,
                    ..ConnectionConfig::default()
                },
            );
            let application = app("t1", "a");
            for id in 0..ENTRIES {
                let timeout = Duration::from_millis(1 + id % 5);
                queue.delay(parked(&conn, id, &application), timeout);
            }

            let drains: Vec<_> = (0..4)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    let application = application.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(round % 4)).await;
                        queue
                            .drain(&application)
                            .into_iter()
                            .map(|parked| {
                                let id = parked.request.request_id();
                                parked.request.abandon();
                                id
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let mut drained = Vec::new();
            for drain in drains {
                drained.extend(drain.await.unwrap());
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(queue.size(), 0);

            let mut answered: HashSet<u64> = drained.iter().copied().collect();
            assert_eq!(answered.len(), drained.len(), "entry drained twice");
            let mut replies = 0;
            while let Ok(message) = rx.try_recv() {
                let OutboundMessage::Frame(bytes) = message else {
                    panic!("unexpected close");
                };
                let cfgsync_core::Frame::Reply(reply) = cfgsync_core::Frame::decode(&bytes).unwrap()
                else {
                    panic!("unexpected request");
                };
                assert!(matches!(reply.body, ReplyBody::Values(_)));
                assert!(answered.insert(reply.id), "request {} answered twice", reply.id);
                replies += 1;
            }
            assert_eq!(replies + drained.len(), usize::try_from(ENTRIES).unwrap());
        }
    }

    #[test]
    fn concurrent_cancel_has_one_winner() {
        for _ in 0..100 {
            let entry = DelayedEntry {
                id: 0,
                application: app("t1", "a"),
                cancelled: AtomicBool::new(false),
                payload: parking_lot::Mutex::new(None),
                timer: parking_lot::Mutex::new(None),
            };
            let wins = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| entry.cancel())).collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .filter(|won| *won)
                    .count()
            });
            assert_eq!(wins, 1);
        }
    }
}
