//! Cooperative cancellation over a `watch` channel.
//!
//! `true` means stop. Loops `select!` on [`cancelled`] next to their work.

use tokio::sync::watch;

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

/// Resolves once the flag is `true`. Never resolves if the sender is gone
/// without having signalled.
pub async fn cancelled(rx: &mut ShutdownReceiver) {
    let sender_gone = rx.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

pub fn is_cancelled(rx: &ShutdownReceiver) -> bool {
    *rx.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancelled_resolves_on_true() {
        let (tx, mut rx) = channel();
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_ignores_false() {
        let (tx, mut rx) = channel();
        tx.send(false).unwrap();
        assert!(timeout(Duration::from_millis(50), cancelled(&mut rx)).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_sender_never_cancels() {
        let (tx, mut rx) = channel();
        drop(tx);
        assert!(timeout(Duration::from_millis(50), cancelled(&mut rx)).await.is_err());
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let (tx, mut rx) = channel();
        tx.send(true).unwrap();
        assert!(is_cancelled(&rx));
        timeout(Duration::from_millis(50), cancelled(&mut rx)).await.unwrap();
    }
}
