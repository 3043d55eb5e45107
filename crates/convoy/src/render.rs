use std::collections::HashMap;

use command_tree::{CommandId, CommandState, MonitorEvent, MonitorReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Line-oriented progress output: consumes a run's monitor events and logs
/// them as they happen. Ends when the event channel closes.
pub fn spawn_printer(mut events: MonitorReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut captions: HashMap<CommandId, String> = HashMap::new();
        while let Some(event) = events.recv().await {
            match event {
                MonitorEvent::ChildAdded { id, caption, .. } => {
                    captions.insert(id, caption);
                }
                MonitorEvent::StateChange { id, state } => {
                    let caption = caption_of(&captions, id);
                    match state {
                        CommandState::Running => debug!("{caption} started"),
                        CommandState::Completed => debug!("{caption} completed"),
                        CommandState::Ready | CommandState::Paused => {}
                    }
                }
                MonitorEvent::Log { id, entry } => {
                    let caption = caption_of(&captions, id);
                    match (entry.fault, entry.message) {
                        (Some(fault), _) => error!("{caption}: {fault}"),
                        (None, Some(message)) => info!("{caption}: {message}"),
                        (None, None) => {}
                    }
                }
                MonitorEvent::Result { id, .. } => {
                    debug!("{} returned a result", caption_of(&captions, id));
                }
                MonitorEvent::Panic { message } => {
                    error!("panic: {message}");
                }
            }
        }
    })
}

fn caption_of(captions: &HashMap<CommandId, String>, id: CommandId) -> String {
    captions
        .get(&id)
        .cloned()
        .filter(|caption| !caption.is_empty())
        .unwrap_or_else(|| format!("command {id}"))
}
