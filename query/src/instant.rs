use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// Wall-clock timestamp used for `data_updated_at` style fields.
/// Contains Duration since Unix Epoch (Unix Timestamp).
///
/// The clock advances with tokio's clock, so paused test runtimes observe
/// virtual time instead of the system clock.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant(pub std::time::Duration);

thread_local! {
    static CLOCK_BASE: (Duration, tokio::time::Instant) = (
        std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default(),
        tokio::time::Instant::now(),
    );
}

impl Instant {
    /// Get the current time as a Unix Timestamp.
    pub fn now() -> Self {
        CLOCK_BASE.with(|(system, tokio_base)| {
            let elapsed = tokio::time::Instant::now().saturating_duration_since(*tokio_base);
            Instant(*system + elapsed)
        })
    }

    /// Builds an instant from milliseconds since the Unix Epoch.
    pub fn from_millis(millis: u64) -> Self {
        Instant(Duration::from_millis(millis))
    }

    /// Milliseconds since the Unix Epoch.
    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + rhs)
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_millis())
    }
}

impl std::fmt::Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Instant").field(&self.0.as_millis()).finish()
    }
}

impl serde::Serialize for Instant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_millis())
    }
}

impl<'de> serde::Deserialize<'de> for Instant {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let millis = <u64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Instant::from_millis(millis))
    }
}
