//! Users and their trading profiles.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub Uuid);

/// Typed handle for the platform-held Lightning identity. Every bond and
/// escrow names this user as its platform-side endpoint, so it is resolved
/// once at startup and injected instead of re-queried by name.
#[derive(Debug, Clone, Copy)]
pub struct PlatformIdentity {
    pub user_id: Id,
}

#[derive(Debug)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub created: DateTime<Utc>,
}

/// How many of the most recent ratings feed the running average.
const RATING_WINDOW: usize = 100;

#[derive(Debug)]
pub struct Profile {
    pub user_id: Id,
    pub total_ratings: i64,
    pub latest_ratings: Vec<i32>,
    pub avg_rating: Option<f64>,
    pub penalty_expiration: Option<DateTime<Utc>>,
}

impl Profile {
    pub(crate) fn new(user_id: Id) -> Self {
        Self {
            user_id,
            total_ratings: 0,
            latest_ratings: Vec::new(),
            avg_rating: None,
            penalty_expiration: None,
        }
    }

    /// Appends a rating and recomputes the mean over the window of the most
    /// recent ratings.
    pub(crate) fn add_rating(&mut self, rating: i32) {
        self.total_ratings += 1;
        self.latest_ratings.push(rating);
        if self.latest_ratings.len() > RATING_WINDOW {
            let excess = self.latest_ratings.len() - RATING_WINDOW;
            self.latest_ratings.drain(..excess);
        }
        let sum: i64 = self.latest_ratings.iter().map(|r| i64::from(*r)).sum();
        self.avg_rating = Some(sum as f64 / self.latest_ratings.len() as f64);
    }

    pub(crate) fn penalize_until(&mut self, expiration: DateTime<Utc>) {
        self.penalty_expiration = Some(expiration);
    }

    /// Remaining penalty in whole seconds, if the user is currently locked
    /// out of making and taking orders.
    pub fn penalty_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        match self.penalty_expiration {
            Some(expiration) if expiration > now => Some((expiration - now).num_seconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile() -> Profile {
        Profile::new(Id(Uuid::from_u128(7)))
    }

    #[test]
    fn first_rating_sets_the_average() {
        let mut profile = profile();
        profile.add_rating(4);
        assert_eq!(profile.total_ratings, 1);
        assert_eq!(profile.latest_ratings, vec![4]);
        assert_eq!(profile.avg_rating, Some(4.0));
    }

    #[test]
    fn average_is_the_mean_of_the_window() {
        let mut profile = profile();
        profile.add_rating(5);
        profile.add_rating(4);
        profile.add_rating(3);
        assert_eq!(profile.total_ratings, 3);
        assert_eq!(profile.avg_rating, Some(4.0));
    }

    #[test]
    fn window_is_bounded_but_total_keeps_counting() {
        let mut profile = profile();
        for _ in 0..150 {
            profile.add_rating(5);
        }
        profile.add_rating(0);
        assert_eq!(profile.latest_ratings.len(), 100);
        assert_eq!(profile.total_ratings, 151);
        assert_eq!(profile.avg_rating, Some(99.0 * 5.0 / 100.0));
    }

    #[test]
    fn penalty_reports_remaining_seconds() {
        let mut profile = profile();
        let now = Utc::now();
        assert_eq!(profile.penalty_remaining(now), None);
        profile.penalize_until(now + Duration::seconds(180));
        assert_eq!(profile.penalty_remaining(now), Some(180));
        assert_eq!(profile.penalty_remaining(now + Duration::seconds(181)), None);
    }
}
