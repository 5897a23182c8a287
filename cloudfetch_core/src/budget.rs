//! Memory budget for in-flight chunk buffers
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::CloudFetchError;

/// A counting semaphore over bytes
///
/// Every chunk reserves its on-the-wire byte count before the download
/// starts and keeps the reservation until the consumer has drained the
/// decoded batches. The sum of all live reservations never exceeds the
/// capacity.
///
/// A reservation larger than the whole capacity is clamped to the
/// capacity, so one oversized chunk degrades the pipeline to serial
/// operation instead of deadlocking it.
#[derive(Debug, Clone)]
pub struct ByteBudget {
    semaphore: Arc<Semaphore>,
    capacity: u64,
}

impl ByteBudget {
    pub fn new(capacity_bytes: u64) -> Self {
        let capacity = capacity_bytes
            .min(u32::MAX as u64)
            .min(Semaphore::MAX_PERMITS as u64);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Waits until `bytes` are available and reserves them.
    ///
    /// The reservation is returned to the budget when the
    /// [BudgetReservation] is dropped.
    pub async fn acquire(&self, bytes: u64) -> Result<BudgetReservation, CloudFetchError> {
        let clamped = bytes.min(self.capacity) as u32;
        let permit = Arc::clone(&self.semaphore)
            .acquire_many_owned(clamped)
            .await
            .map_err(|_| CloudFetchError::new_cancelled())?;

        Ok(BudgetReservation {
            _permit: permit,
            bytes: clamped as u64,
        })
    }

    /// Bytes currently not reserved.
    pub fn available(&self) -> u64 {
        self.semaphore.available_permits() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// A live reservation against a [ByteBudget]
///
/// Dropping it releases the reserved bytes.
#[derive(Debug)]
pub struct BudgetReservation {
    _permit: OwnedSemaphorePermit,
    bytes: u64,
}

impl BudgetReservation {
    /// The number of bytes this reservation holds.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}
