#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub active_tasks: usize,
    pub idle_workers: usize,
    pub live_workers: usize,
    pub largest_workers: usize,
    pub queued_tasks: usize,
    pub total_submitted: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub rejected_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.live_workers == 0 {
            return 0.0;
        }
        self.active_tasks as f64 / self.live_workers as f64
    }

    pub fn queue_pressure(&self) -> f64 {
        self.queued_tasks as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / total as f64
    }
}

/// Снимок состояния группы троттлинга.
#[derive(Debug, Clone)]
pub struct GroupMetrics {
    pub name: String,
    pub permits: u32,
    pub available: u32,
    pub waiting: usize,
}

impl GroupMetrics {
    pub fn in_use(&self) -> u32 {
        self.permits.saturating_sub(self.available)
    }
}
