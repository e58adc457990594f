use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::telegram::MessageSender;

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

/// The next `at` after `now`: today if it has not passed yet, otherwise
/// tomorrow. A day already in `last_sent` is skipped, since the wall clock
/// may still read slightly before `at` after the sleep ends.
pub fn next_broadcast(now: NaiveDateTime, at: NaiveTime, last_sent: Option<NaiveDate>) -> NaiveDateTime {
    let mut next = now.date().and_time(at);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    if Some(next.date()) == last_sent {
        next += chrono::Duration::days(1);
    }
    next
}

/// Send today's available slots to `chat_id` every day at `at` local time.
pub async fn run_daily_broadcast(
    engine: Arc<Engine>,
    sender: Arc<dyn MessageSender>,
    chat_id: String,
    at: NaiveTime,
) {
    let mut last_sent = None;
    loop {
        let now = chrono::Local::now().naive_local();
        let next = next_broadcast(now, at, last_sent);
        let wait = next - now;
        debug!("next broadcast in {} minutes", wait.num_minutes());
        tokio::time::sleep(wait.to_std().unwrap_or(Duration::from_secs(60))).await;

        let day = next.date();
        last_sent = Some(day);
        let report = match engine
            .available_slots_report(day, engine.policy.business_window(), None)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!("daily broadcast skipped: {e}");
                continue;
            }
        };
        if let Err(e) = sender.send(&chat_id, &report.share_text()).await {
            warn!("daily broadcast failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingPolicy;
    use crate::model::Actor;
    use crate::notify::NotifyHub;
    use crate::request::{CreateBranchRequest, CreateVenueRequest};
    use crate::telegram::TelegramError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl MessageSender for Recorder {
        async fn send(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
            self.0.lock().unwrap().push((chat_id.into(), text.into()));
            Ok(())
        }
    }

    #[test]
    fn next_run_today_or_tomorrow() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let early = day.and_hms_opt(8, 0, 0).unwrap();
        let late = day.and_hms_opt(10, 0, 0).unwrap();
        let tomorrow = day.succ_opt().unwrap().and_time(nine);
        assert_eq!(next_broadcast(early, nine, None), day.and_time(nine));
        assert_eq!(next_broadcast(late, nine, None), tomorrow);
        assert_eq!(next_broadcast(day.and_time(nine), nine, None), tomorrow);
    }

    #[test]
    fn early_wakeup_does_not_repeat_the_day() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let just_before = day.and_hms_milli_opt(8, 59, 59, 900).unwrap();
        assert_eq!(
            next_broadcast(just_before, nine, Some(day)),
            day.succ_opt().unwrap().and_time(nine)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_sends_share_text() {
        let engine = Arc::new(
            Engine::new(test_wal_path("broadcast.wal"), Arc::new(NotifyHub::new()), BookingPolicy::default())
                .unwrap(),
        );
        let admin = Actor::admin(Ulid::new());
        let branch = engine
            .create_branch(CreateBranchRequest { name: "North".into() }, &admin)
            .await
            .unwrap();
        engine
            .create_venue(CreateVenueRequest { branch_id: branch.id, name: "Court 1".into() }, &admin)
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let at = (chrono::Local::now() + chrono::Duration::minutes(1)).time();
        let task = tokio::spawn(run_daily_broadcast(engine, recorder.clone(), "-100".into(), at));
        tokio::time::sleep(Duration::from_secs(120)).await;
        task.abort();

        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "-100");
        assert!(sent[0].1.contains("Court 1: 08:00-23:00"));
    }
}
