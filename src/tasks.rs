//! Periodic maintenance: write-queue flushing, cache sweeping and the reset
//! check. Each task has its own stop channel so it can be stopped alone.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Interval, MissedTickBehavior},
};

use crate::{config::TaskConfig, database::FlushReport, service::ActivityService};

pub const FLUSH_TASK: &str = "flush";
pub const SWEEP_TASK: &str = "sweep";
pub const RESET_TASK: &str = "reset";

struct TaskHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("Background task {} ended abnormally: {}", self.name, e);
        }
    }
}

pub struct BackgroundTasks {
    tasks: Vec<TaskHandle>,
}

impl BackgroundTasks {
    pub fn spawn(service: Arc<ActivityService>, config: &TaskConfig) -> Self {
        let mut tasks = BackgroundTasks { tasks: Vec::new() };
        tasks.start(FLUSH_TASK, |stop| {
            flush_loop(service.clone(), config.flush_interval, stop)
        });
        tasks.start(SWEEP_TASK, |stop| {
            sweep_loop(service.clone(), config.sweep_interval, stop)
        });
        tasks.start(RESET_TASK, |stop| {
            reset_loop(service.clone(), config.reset_check_interval, stop)
        });
        tasks
    }

    fn start<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(task(stopped));
        debug!("Started background task {}", name);
        self.tasks.push(TaskHandle { name, stop, handle });
    }

    pub fn running(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }

    /// Stops one task and waits for it. Returns `false` for unknown names.
    pub async fn stop(&mut self, name: &str) -> bool {
        match self.tasks.iter().position(|t| t.name == name) {
            Some(index) => {
                self.tasks.remove(index).stop().await;
                true
            }
            None => false,
        }
    }

    /// Stops every task, then drains the write queue within `drain_timeout`.
    pub async fn shutdown(
        mut self,
        service: &ActivityService,
        drain_timeout: Duration,
    ) -> Option<FlushReport> {
        for name in self.running() {
            self.stop(name).await;
        }

        match time::timeout(drain_timeout, service.flush()).await {
            Ok(Ok(report)) => {
                info!("Drained {} queued writes on shutdown", report.ops);
                Some(report)
            }
            Ok(Err(e)) => {
                error!("Final flush failed: {}", e);
                None
            }
            Err(_) => {
                error!("Final flush did not finish within {:?}", drain_timeout);
                None
            }
        }
    }
}

async fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    interval
}

async fn flush_loop(
    service: Arc<ActivityService>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = ticker(period).await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = service.flush_requested() => {}
            _ = stop.changed() => break,
        }
        if let Err(e) = service.flush().await {
            error!("Scheduled flush failed: {}", e);
        }
    }
}

async fn sweep_loop(
    service: Arc<ActivityService>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = ticker(period).await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        service.sweep();
    }
}

async fn reset_loop(
    service: Arc<ActivityService>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = ticker(period).await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if let Err(e) = service.run_reset_cycle(Utc::now()).await {
            error!("Reset check failed: {}", e);
        }
    }
}
