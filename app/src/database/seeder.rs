use super::{Database, Transaction};
use chrono::Utc;
use uuid::Uuid;

pub async fn seed_development_data(db: &Database) {
    let mut data_tx = db.begin().await.unwrap();
    seed_test_user(&mut data_tx, 1).await;
    seed_test_user(&mut data_tx, 2).await;
    data_tx.commit().await.unwrap();
}

async fn seed_test_user(data_tx: &mut Transaction, index: u128) {
    let row = sqlx::query(r#"SELECT id FROM users WHERE id = $1"#)
        .bind(Uuid::from_u128(index))
        .fetch_optional(&mut *data_tx)
        .await
        .unwrap();
    if row.is_some() {
        return;
    }
    sqlx::query("INSERT INTO users (id, username, created) VALUES ($1, $2, $3)")
        .bind(Uuid::from_u128(index))
        .bind(format!("test-robot-{}", index))
        .bind(Utc::now())
        .execute(&mut *data_tx)
        .await
        .unwrap();
    sqlx::query(
        r#"INSERT INTO profiles (user_id, total_ratings, latest_ratings, avg_rating, penalty_expiration)
            VALUES ($1, 0, $2, NULL, NULL)"#,
    )
    .bind(Uuid::from_u128(index))
    .bind(Vec::<i32>::new())
    .execute(&mut *data_tx)
    .await
    .unwrap();
}
