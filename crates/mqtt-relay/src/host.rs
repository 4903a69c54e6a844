//! Host side of the relay: registers the consumers declared in the
//! environment file and reports what they observe.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use mqtt_relay::{
    Comparison, ConnectionStatus, FeedbackCheck, HostEvent, Interest, InterestId, RelayError,
    RelayHandle,
};
use mqtt_relay_metadata::Environment;

struct DeclaredVariable {
    id: InterestId,
    topic: String,
    path: Option<String>,
    name: String,
}

struct DeclaredFeedback {
    id: InterestId,
    check: FeedbackCheck,
}

pub struct Host {
    relay: RelayHandle,
    variables: Vec<DeclaredVariable>,
    feedbacks: Vec<DeclaredFeedback>,
    values: BTreeMap<String, String>,
    states: HashMap<InterestId, bool>,
}

impl Host {
    pub fn new(relay: RelayHandle, env: &Environment) -> Result<Self, RelayError> {
        let variables = env
            .variables
            .iter()
            .enumerate()
            .map(|(index, spec)| DeclaredVariable {
                id: spec.resolved_id(index).into(),
                topic: spec.topic.clone(),
                path: spec.path.clone(),
                name: spec.variable.clone(),
            })
            .collect();

        let feedbacks = env
            .feedbacks
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let comparison: Comparison = spec.comparison.parse()?;
                Ok(DeclaredFeedback {
                    id: spec.resolved_id(index).into(),
                    check: FeedbackCheck {
                        topic: spec.topic.clone(),
                        path: spec.path.clone().filter(|p| !p.is_empty()),
                        target: spec.value.clone(),
                        comparison: comparison.to_string(),
                    },
                })
            })
            .collect::<Result<Vec<_>, RelayError>>()?;

        Ok(Self {
            relay,
            variables,
            feedbacks,
            values: BTreeMap::new(),
            states: HashMap::new(),
        })
    }

    /// Register every declared consumer with the relay
    pub async fn register_all(&self) -> Result<(), RelayError> {
        for variable in &self.variables {
            let interest = Interest::variable(
                variable.id.clone(),
                variable.name.clone(),
                variable.path.clone(),
            );
            self.relay.register(variable.topic.clone(), interest).await?;
        }
        for feedback in &self.feedbacks {
            let interest = Interest::feedback(feedback.id.clone(), feedback.check.path.clone());
            self.relay
                .register(feedback.check.topic.clone(), interest)
                .await?;
        }
        info!(
            variables = self.variables.len(),
            feedbacks = self.feedbacks.len(),
            "registered declared consumers"
        );
        Ok(())
    }

    #[cfg(test)]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    #[cfg(test)]
    pub fn feedback_state(&self, id: &InterestId) -> Option<bool> {
        self.states.get(id).copied()
    }

    pub async fn handle_event(&mut self, event: HostEvent) -> Result<(), RelayError> {
        match event {
            HostEvent::VariableValues(values) => {
                for (name, value) in values {
                    info!(variable = %name, value = %value, "variable updated");
                    self.values.insert(name, value);
                }
            }
            HostEvent::CheckFeedbacks(ids) => {
                for id in ids {
                    self.check_feedback(&id).await?;
                }
            }
            HostEvent::VariableDefinitions(definitions) => {
                let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
                info!(count = definitions.len(), names = ?names, "variable definitions changed");
                self.values
                    .retain(|name, _| definitions.iter().any(|d| &d.name == name));
            }
            HostEvent::ResubscribeRequested => self.register_all().await?,
        }
        Ok(())
    }

    async fn check_feedback(&mut self, id: &InterestId) -> Result<(), RelayError> {
        let Some(feedback) = self.feedbacks.iter().find(|f| &f.id == id) else {
            debug!(feedback = %id, "feedback not declared here");
            return Ok(());
        };
        let active = self.relay.evaluate_feedback(feedback.check.clone()).await?;
        let previous = self.states.insert(id.clone(), active);
        if previous != Some(active) {
            info!(
                feedback = %id,
                topic = %feedback.check.topic,
                active,
                "feedback state changed"
            );
        }
        Ok(())
    }

    /// Handle relay events until shutdown is signalled or the relay stops
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let mut status = self.relay.status();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            warn!(error = %e, "failed to handle relay event");
                            if e == RelayError::Closed {
                                return Err(e);
                            }
                        }
                    }
                    None => return Err(RelayError::Closed),
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(RelayError::Closed);
                    }
                    match &*status.borrow_and_update() {
                        ConnectionStatus::Error(msg) => warn!(error = %msg, "broker status: error"),
                        ConnectionStatus::Warning(msg) => warn!(warning = %msg, "broker status: warning"),
                        other => info!(status = %other, "broker status"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutting down relay");
                    return self.relay.shutdown().await;
                }
            }
        }
    }
}
