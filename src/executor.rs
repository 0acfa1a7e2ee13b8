// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Executor
//!
//! Shared pool running consumption jobs on the tokio runtime. The pool is
//! elastic by default (one task per job) or bounded by a semaphore when a
//! maximum concurrency is configured. Submission never waits for capacity,
//! so polling is never blocked by consumption.

use crate::{config::ExecutorConfig, errors::MercuryError};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{Notify, Semaphore};
use tracing::error;

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when the job finishes, even if it panics.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct ConsumptionExecutor {
    limit: Option<Arc<Semaphore>>,
    in_flight: Arc<InFlight>,
}

impl ConsumptionExecutor {
    /// Runs every submitted job immediately on its own task.
    pub fn elastic() -> ConsumptionExecutor {
        ConsumptionExecutor {
            limit: None,
            in_flight: Arc::default(),
        }
    }

    /// Runs at most `max_concurrency` jobs at a time; the rest wait for a permit.
    pub fn bounded(max_concurrency: usize) -> Result<ConsumptionExecutor, MercuryError> {
        if max_concurrency == 0 {
            return Err(MercuryError::InvalidConfiguration(
                "executor max_concurrency must be at least 1".to_owned(),
            ));
        }

        Ok(ConsumptionExecutor {
            limit: Some(Arc::new(Semaphore::new(max_concurrency))),
            in_flight: Arc::default(),
        })
    }

    pub fn from_config(cfg: &ExecutorConfig) -> Result<ConsumptionExecutor, MercuryError> {
        match cfg.max_concurrency {
            Some(max) => Self::bounded(max),
            None => Ok(Self::elastic()),
        }
    }

    /// Schedules a job without waiting for it to start.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(self.in_flight.clone());
        let limit = self.limit.clone();

        tokio::spawn(async move {
            let _guard = guard;

            let _permit = match limit {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!("consumption executor closed, dropping job");
                        return;
                    }
                },
                None => None,
            };

            job.await;
        });
    }

    /// Jobs submitted and not yet finished, including those waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Default for ConsumptionExecutor {
    fn default() -> Self {
        Self::elastic()
    }
}
