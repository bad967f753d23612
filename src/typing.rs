//! Keep a side effect firing while a long request runs.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, interval_at};

/// Drive `main` to completion, calling `tick` every `every` until it resolves.
///
/// Ticking stops after the first tick error. If `main` fails its error is
/// returned; otherwise a tick error, if any, is returned instead of the value.
pub async fn with_ticker<T, E, M, K, KF>(main: M, mut tick: K, every: Duration) -> Result<T, E>
where
    M: Future<Output = Result<T, E>>,
    K: FnMut() -> KF,
    KF: Future<Output = Result<(), E>>,
{
    tokio::pin!(main);
    let mut ticker = interval_at(Instant::now() + every, every);
    let mut tick_error: Option<E> = None;

    loop {
        tokio::select! {
            out = &mut main => {
                return match (out, tick_error) {
                    (Err(e), _) => Err(e),
                    (Ok(_), Some(e)) => Err(e),
                    (Ok(value), None) => Ok(value),
                };
            }
            _ = ticker.tick(), if tick_error.is_none() => {
                if let Err(e) = tick().await {
                    tick_error = Some(e);
                }
            }
        }
    }
}
