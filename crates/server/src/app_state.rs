use board_api::ApiContext;
use shared::protocol::BoardEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<BoardEvent>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { api, events }
    }

    /// Fans an event out to websocket subscribers. Having none is fine.
    pub(crate) fn publish(&self, event: &BoardEvent) {
        let _ = self.events.send(event.clone());
    }
}
