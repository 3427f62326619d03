use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Wall-clock source shared by every time-dependent component.
///
/// A manual clock starts at a fixed instant and advances with the tokio clock, so
/// tests running with paused time can cross hours (or midnight) without sleeping.
#[derive(Clone)]
pub struct Clock {
    source: Source,
}

#[derive(Clone)]
enum Source {
    System,
    Manual(Arc<Mutex<Anchor>>),
}

struct Anchor {
    at: DateTime<Utc>,
    base: Instant,
}

impl Clock {
    pub fn system() -> Self {
        Self {
            source: Source::System,
        }
    }

    pub fn manual(at: DateTime<Utc>) -> Self {
        Self {
            source: Source::Manual(Arc::new(Mutex::new(Anchor {
                at,
                base: Instant::now(),
            }))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.source {
            Source::System => Utc::now(),
            Source::Manual(anchor) => {
                let anchor = match anchor.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => {
                        tracing::warn!("Clock anchor lock poisoned; recovering");
                        poisoned.into_inner()
                    }
                };
                let elapsed = chrono::Duration::from_std(anchor.base.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                anchor.at + elapsed
            }
        }
    }

    /// Jumps a manual clock to `at`. No effect on the system clock.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Source::Manual(anchor) = &self.source {
            let mut anchor = match anchor.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            anchor.at = at;
            anchor.base = Instant::now();
        }
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    pub async fn sleep_until(&self, at: DateTime<Utc>) {
        let remaining = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.sleep(remaining).await;
    }
}
