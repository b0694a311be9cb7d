//! Drop-oldest frame queues.
//!
//! `tokio::sync::broadcast` evicts the oldest value when it is full, but it
//! rounds its capacity up to a power of two. [`BoundedReceiver`] trims the
//! surplus on the receiving side, so no more than `bound` values ever wait
//! to be delivered.

use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

/// Creates a queue holding at most `bound` undelivered values.
pub fn channel<T: Clone>(bound: usize) -> (broadcast::Sender<T>, BoundedReceiver<T>) {
    let bound = bound.max(1);
    let (tx, rx) = broadcast::channel(bound);
    (tx, BoundedReceiver { rx, bound })
}

/// Receiving end of [`channel`].
#[derive(Debug)]
pub struct BoundedReceiver<T> {
    rx: broadcast::Receiver<T>,
    bound: usize,
}

impl<T: Clone> BoundedReceiver<T> {
    /// Like [`broadcast::Receiver::recv`]. A value that still has `bound` or
    /// more newer values behind it is discarded and reported as `Lagged(1)`.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        let value = self.rx.recv().await?;
        self.within_bound(value).map_err(RecvError::Lagged)
    }

    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let value = self.rx.try_recv()?;
        self.within_bound(value).map_err(TryRecvError::Lagged)
    }

    fn within_bound(&self, value: T) -> Result<T, u64> {
        if self.rx.len() >= self.bound {
            Err(1)
        } else {
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drains everything, returning delivered values and the dropped count.
    fn drain(rx: &mut BoundedReceiver<u32>) -> (Vec<u32>, u64) {
        let mut delivered = Vec::new();
        let mut dropped = 0;
        loop {
            match rx.try_recv() {
                Ok(v) => delivered.push(v),
                Err(TryRecvError::Lagged(n)) => dropped += n,
                Err(_) => return (delivered, dropped),
            }
        }
    }

    #[test]
    fn keeps_exactly_bound_newest_values() {
        // broadcast would keep 4 here.
        let (tx, mut rx) = channel(3);
        for v in 0..6 {
            tx.send(v).unwrap();
        }
        assert_eq!(drain(&mut rx), (vec![3, 4, 5], 3));
    }

    #[test]
    fn power_of_two_bound_matches_broadcast() {
        let (tx, mut rx) = channel(4);
        for v in 0..6 {
            tx.send(v).unwrap();
        }
        assert_eq!(drain(&mut rx), (vec![2, 3, 4, 5], 2));
    }

    #[test]
    fn nothing_is_dropped_within_bound() {
        let (tx, mut rx) = channel(5);
        for v in 0..5 {
            tx.send(v).unwrap();
        }
        assert_eq!(drain(&mut rx), (vec![0, 1, 2, 3, 4], 0));
    }

    #[tokio::test]
    async fn closed_after_the_last_value() {
        let (tx, mut rx) = channel(2);
        tx.send(7u32).unwrap();
        drop(tx);
        assert_eq!(rx.recv().await.unwrap(), 7);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }
}
