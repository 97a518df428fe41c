use crate::database::{Database, Transaction};

mod entities;

pub use entities::{Id, PlatformIdentity, Profile, User};

pub async fn get(db: &Database, id: Id) -> Option<User> {
    queries::get(db, id).await
}

pub async fn get_by_username(db: &Database, username: &str) -> Option<User> {
    queries::get_by_username(db, username).await
}

/// Resolves the platform escrow identity, creating the backing user row on
/// first run.
pub async fn ensure_platform_identity(db: &Database, username: &str) -> PlatformIdentity {
    if let Some(user) = queries::get_by_username(db, username).await {
        return PlatformIdentity { user_id: user.id };
    }
    let mut data_tx = db.begin().await.unwrap();
    let user = queries::create(&mut data_tx, username).await;
    data_tx.commit().await.unwrap();
    log::info!("created platform escrow user {:?}", username);
    PlatformIdentity { user_id: user.id }
}

pub async fn profile(db: &Database, id: Id) -> Profile {
    queries::profile(db, id).await
}

pub(crate) async fn profile_in_tx(data_tx: &mut Transaction, id: Id) -> Profile {
    queries::profile_in_tx(data_tx, id).await
}

pub(crate) async fn update_profile(data_tx: &mut Transaction, profile: &Profile) {
    queries::update_profile(data_tx, profile).await
}

mod queries {
    use super::{Id, Profile, User};
    use crate::database::{Database, Transaction};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    pub(super) async fn get(db: &Database, id: Id) -> Option<User> {
        sqlx::query_as::<_, UserRow>("SELECT id, username, created FROM users WHERE id = $1")
            .bind(id.0)
            .fetch_optional(db)
            .await
            .unwrap()
            .map(|row| row.into_entity())
    }

    pub(super) async fn get_by_username(db: &Database, username: &str) -> Option<User> {
        sqlx::query_as::<_, UserRow>("SELECT id, username, created FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(db)
            .await
            .unwrap()
            .map(|row| row.into_entity())
    }

    pub(super) async fn create(data_tx: &mut Transaction, username: &str) -> User {
        let user = User {
            id: Id(Uuid::new_v4()),
            username: username.to_owned(),
            created: Utc::now(),
        };
        sqlx::query("INSERT INTO users (id, username, created) VALUES ($1, $2, $3)")
            .bind(user.id.0)
            .bind(&user.username)
            .bind(user.created)
            .execute(&mut *data_tx)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO profiles (user_id, total_ratings, latest_ratings) VALUES ($1, 0, $2)",
        )
        .bind(user.id.0)
        .bind(Vec::<i32>::new())
        .execute(&mut *data_tx)
        .await
        .unwrap();
        user
    }

    const PROFILE_COLUMNS: &str =
        "user_id, total_ratings, latest_ratings, avg_rating, penalty_expiration";

    pub(super) async fn profile(db: &Database, id: Id) -> Profile {
        sqlx::query_as::<_, ProfileRow>(&format!(
            "SELECT {} FROM profiles WHERE user_id = $1",
            PROFILE_COLUMNS
        ))
        .bind(id.0)
        .fetch_one(db)
        .await
        .unwrap()
        .into_entity()
    }

    pub(super) async fn profile_in_tx(data_tx: &mut Transaction, id: Id) -> Profile {
        sqlx::query_as::<_, ProfileRow>(&format!(
            "SELECT {} FROM profiles WHERE user_id = $1",
            PROFILE_COLUMNS
        ))
        .bind(id.0)
        .fetch_one(data_tx)
        .await
        .unwrap()
        .into_entity()
    }

    pub(super) async fn update_profile(data_tx: &mut Transaction, profile: &Profile) {
        sqlx::query(
            r#"UPDATE profiles SET total_ratings = $2, latest_ratings = $3, avg_rating = $4,
                penalty_expiration = $5 WHERE user_id = $1"#,
        )
        .bind(profile.user_id.0)
        .bind(profile.total_ratings)
        .bind(&profile.latest_ratings)
        .bind(profile.avg_rating)
        .bind(profile.penalty_expiration)
        .execute(&mut *data_tx)
        .await
        .unwrap();
    }

    #[derive(sqlx::FromRow, Debug)]
    struct UserRow {
        id: Uuid,
        username: String,
        created: DateTime<Utc>,
    }

    impl UserRow {
        fn into_entity(self) -> User {
            User {
                id: Id(self.id),
                username: self.username,
                created: self.created,
            }
        }
    }

    #[derive(sqlx::FromRow, Debug)]
    struct ProfileRow {
        user_id: Uuid,
        total_ratings: i64,
        latest_ratings: Vec<i32>,
        avg_rating: Option<f64>,
        penalty_expiration: Option<DateTime<Utc>>,
    }

    impl ProfileRow {
        fn into_entity(self) -> Profile {
            Profile {
                user_id: Id(self.user_id),
                total_ratings: self.total_ratings,
                latest_ratings: self.latest_ratings,
                avg_rating: self.avg_rating,
                penalty_expiration: self.penalty_expiration,
            }
        }
    }
}
