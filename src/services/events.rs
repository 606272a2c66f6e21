//! Event system for recommendation operations
//!
//! Services announce every state change on the bus. Listeners use it for
//! audit logging and for the refresh trigger that regenerates subjects
//! whose inputs changed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::models::{
    BehaviorEventId, BehaviorType, RecommendationId, RecommendationStatus, SubjectId, SubjectType,
    TargetId, TargetType,
};

/// Events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum RecommendationEvent {
    BehaviorRecorded {
        event_id: BehaviorEventId,
        actor_id: SubjectId,
        /// Subject type the actor was attributed to
        actor_type: SubjectType,
        target_id: TargetId,
        target_type: TargetType,
        behavior_type: BehaviorType,
    },
    ProfileUpdated {
        subject_id: SubjectId,
        subject_type: SubjectType,
        revision: i64,
    },
    RecommendationsGenerated {
        subject_id: SubjectId,
        subject_type: SubjectType,
        batch_id: String,
        created: usize,
        reranked: usize,
        retired: usize,
    },
    StatusChanged {
        recommendation_id: RecommendationId,
        subject_id: SubjectId,
        subject_type: SubjectType,
        from: RecommendationStatus,
        to: RecommendationStatus,
    },
}

impl RecommendationEvent {
    /// Subject whose recommendations may now be stale
    pub fn dirty_subject(&self) -> Option<(SubjectType, SubjectId)> {
        match self {
            RecommendationEvent::BehaviorRecorded {
                actor_id, actor_type, ..
            } => Some((*actor_type, *actor_id)),
            RecommendationEvent::ProfileUpdated {
                subject_id,
                subject_type,
                ..
            } => Some((*subject_type, *subject_id)),
            RecommendationEvent::RecommendationsGenerated { .. }
            | RecommendationEvent::StatusChanged { .. } => None,
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RecommendationEvent);
}

/// Event bus for broadcasting recommendation events
pub struct EventBus {
    sender: broadcast::Sender<RecommendationEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: RecommendationEvent) {
        trace!(event = ?event, "Emitting recommendation event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecommendationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &RecommendationEvent) {
        match event {
            RecommendationEvent::BehaviorRecorded {
                actor_id,
                target_id,
                behavior_type,
                ..
            } => {
                debug!(actor_id, target_id, behavior = %behavior_type, "Behavior recorded");
            }
            RecommendationEvent::ProfileUpdated {
                subject_id,
                subject_type,
                revision,
            } => {
                debug!(subject_id, subject_type = %subject_type, revision, "Profile updated");
            }
            RecommendationEvent::RecommendationsGenerated {
                subject_id,
                subject_type,
                created,
                reranked,
                retired,
                ..
            } => {
                info!(
                    subject_id,
                    subject_type = %subject_type,
                    created,
                    reranked,
                    retired,
                    "Recommendations generated"
                );
            }
            RecommendationEvent::StatusChanged {
                recommendation_id,
                from,
                to,
                ..
            } => {
                debug!(recommendation_id, from = %from, to = %to, "Recommendation status changed");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
