//! External monitors for bounces and meeting bookings.
//!
//! Monitors own their inbox scanning and lead mutation. The supervisor only
//! consumes the counts they report.

use async_trait::async_trait;

use crate::error::MonitorError;

/// Counts reported by one monitor scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub found: u32,
    pub processed: u32,
}

#[async_trait]
pub trait DeliveryFailureMonitor: Send + Sync {
    async fn scan(&self) -> Result<ScanSummary, MonitorError>;
}

#[async_trait]
pub trait BookingMonitor: Send + Sync {
    /// Returns the number of bookings processed.
    async fn scan(&self) -> Result<u32, MonitorError>;
}

/// Monitor used when no inbox scanning is wired in. Reports nothing.
pub struct IdleMonitor;

#[async_trait]
impl DeliveryFailureMonitor for IdleMonitor {
    async fn scan(&self) -> Result<ScanSummary, MonitorError> {
        Ok(ScanSummary::default())
    }
}

#[async_trait]
impl BookingMonitor for IdleMonitor {
    async fn scan(&self) -> Result<u32, MonitorError> {
        Ok(0)
    }
}
