use tokio::sync::Notify;


/// Edge-triggered wakeup for a single consumer task (the apply loop, the
/// cycle loop). A notification arriving while the consumer is busy is
/// remembered, so the consumer never misses a change as long as it re-checks
/// its condition after every wait
pub struct ChangeEvent {
	notify: Notify
}

impl ChangeEvent {
	pub fn new() -> Self {
		ChangeEvent { notify: Notify::new() }
	}

	pub fn notify(&self) {
		// notify_one stores a permit if no one is currently waiting
		self.notify.notify_one();
	}

	pub async fn wait(&self) {
		self.notify.notified().await;
	}
}
