use futures::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe};

mod concurrency;
mod worker;

pub mod btc;
pub mod database;
pub mod ln;
pub mod order;
pub mod payment;
pub mod pricing;
pub mod seconds;
pub mod trade;
pub mod user;

async fn swallow_panic(f: impl Future<Output = ()>) {
    let _ = AssertUnwindSafe(f).catch_unwind().await;
}
