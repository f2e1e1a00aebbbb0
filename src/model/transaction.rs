use std::future::Future;

use log::debug;

use crate::error::{Error, Result};

/// Run `attempt` until it stops failing with a transaction conflict, retrying
/// at most `retries` times. Each attempt must re-read whatever it depends on.
pub async fn retry_on_conflict<T, F, Fut>(retries: usize, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retried = 0;
    loop {
        match attempt().await {
            Err(Error::TransactionConflict) if retried < retries => {
                retried += 1;
                debug!("Transaction conflict, retrying ({retried}/{retries})");
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[rocket::async_test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_on_conflict(3, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(Error::TransactionConflict),
                n => Ok(n),
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[rocket::async_test]
    async fn gives_up_after_the_retry_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_conflict(2, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::TransactionConflict)
        })
        .await;
        assert!(matches!(result, Err(Error::TransactionConflict)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[rocket::async_test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_conflict(5, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::RateLimit)
        })
        .await;
        assert!(matches!(result, Err(Error::RateLimit)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
