#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seconds(pub i64);

impl Seconds {
    pub fn minutes(minutes: i64) -> Self {
        Self(minutes * 60)
    }

    pub fn hours(hours: i64) -> Self {
        Self(hours * 3600)
    }
}
