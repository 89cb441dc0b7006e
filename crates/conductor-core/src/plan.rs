//! Plan gate: generate, refine and approve pre-execution plans.
//!
//! Planning runs the agent in-process against the project repository (no
//! container, read-oriented work). Assistant output streams live to the
//! `plan:<pid>:<tid>` topic while the final plan text, clarification
//! answers and the full conversation transcript are persisted on the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use conductor_store::models::{PlanMessage, PlanRole, Task, TaskStatus};
use conductor_store::{Store, StoreError};

use crate::agent::{AgentError, AgentInvoker, AgentRequest};
use crate::bus::{self, EventBus};
use crate::stream::LogEvent;

/// Cap on one planning agent call. Exceeding it leaves the task in
/// `plan_pending` with an empty plan for the operator to retry.
pub const PLAN_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of a batch approval for one task.
#[derive(Debug)]
pub struct BatchResult {
    pub task_id: String,
    pub result: Result<(), StoreError>,
}

/// The plan service.
pub struct PlanService {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    agent: Arc<dyn AgentInvoker>,
    timeout: Duration,
}

impl PlanService {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, agent: Arc<dyn AgentInvoker>) -> Self {
        Self {
            store,
            bus,
            agent,
            timeout: PLAN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate (or regenerate) the plan for a task.
    ///
    /// Moves `pending -> plan_pending`, runs the planning conversation, and
    /// persists plan text plus transcript. A timed-out or failed agent call
    /// leaves the task in `plan_pending` with whatever was produced.
    pub async fn generate(&self, project_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let task = self.store.update_task(project_id, task_id, |task| {
            match task.status {
                TaskStatus::Pending => task.transition_to(TaskStatus::PlanPending),
                // Regeneration while still gated is fine.
                TaskStatus::PlanPending => Ok(()),
                other => Err(StoreError::Conflict {
                    task_id: task.id.clone(),
                    from: other.to_string(),
                    to: TaskStatus::PlanPending.to_string(),
                }),
            }
        })?;

        let repo = self.store.data_dir().repo_dir(project_id);
        let prompt = compose_plan_prompt(&task);
        let topic = bus::topic_plan(project_id, task_id);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forward = self.spawn_forwarder(topic.clone(), events_rx);

        let outcome = self
            .agent
            .invoke(AgentRequest {
                prompt,
                workdir: repo,
                timeout: self.timeout,
                events: Some(events_tx),
            })
            .await;
        let _ = forward.await;

        let (plan_text, note) = match outcome {
            Ok(outcome) => (outcome.text, None),
            Err(AgentError::Timeout(d)) => {
                tracing::warn!(task_id, "plan generation exceeded {d:?}");
                (String::new(), Some(format!("plan generation exceeded {} s", d.as_secs())))
            }
            Err(e) => {
                tracing::warn!(task_id, error = %e, "plan generation failed");
                (String::new(), Some(e.to_string()))
            }
        };

        let updated = self.store.update_task(project_id, task_id, |task| {
            if !plan_text.is_empty() {
                task.plan = Some(plan_text.clone());
                task.plan_messages.push(PlanMessage {
                    role: PlanRole::Assistant,
                    content: plan_text.clone(),
                    timestamp: Utc::now(),
                });
            }
            task.error = note.clone();
            Ok(())
        })?;

        self.publish_transcript_frame(&topic, PlanRole::Assistant, updated.plan.as_deref().unwrap_or(""));
        Ok(updated)
    }

    /// Record answers and open the gate: `plan_pending -> plan_approved`.
    pub fn approve(
        &self,
        project_id: &str,
        task_id: &str,
        answers: Option<Value>,
    ) -> Result<Task, StoreError> {
        self.store.update_task(project_id, task_id, |task| {
            task.transition_to(TaskStatus::PlanApproved)?;
            task.plan_approved = true;
            task.plan_answers = answers.clone();
            Ok(())
        })
    }

    /// Fold feedback into the description and send the task back to
    /// `pending` for a fresh round.
    pub fn reject(
        &self,
        project_id: &str,
        task_id: &str,
        feedback: Option<&str>,
    ) -> Result<Task, StoreError> {
        self.store.update_task(project_id, task_id, |task| {
            task.transition_to(TaskStatus::Pending)?;
            if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
                task.description = format!(
                    "[operator feedback] {}\n\n{}",
                    feedback.trim(),
                    task.description
                );
            }
            task.plan_approved = false;
            Ok(())
        })
    }

    /// Approve or reject a list of tasks; partial failures are reported
    /// per task.
    pub fn batch(
        &self,
        project_id: &str,
        task_ids: &[String],
        approved: bool,
        feedback: Option<&str>,
    ) -> Vec<BatchResult> {
        task_ids
            .iter()
            .map(|task_id| BatchResult {
                task_id: task_id.clone(),
                result: if approved {
                    self.approve(project_id, task_id, None).map(|_| ())
                } else {
                    self.reject(project_id, task_id, feedback).map(|_| ())
                },
            })
            .collect()
    }

    /// Conversational refinement: append the user turn, run a follow-up
    /// agent call over the transcript, stream and persist the reply.
    pub async fn chat(
        &self,
        project_id: &str,
        task_id: &str,
        message: &str,
    ) -> Result<Task, StoreError> {
        let topic = bus::topic_plan(project_id, task_id);

        let task = self.store.update_task(project_id, task_id, |task| {
            if task.status != TaskStatus::PlanPending {
                return Err(StoreError::Conflict {
                    task_id: task.id.clone(),
                    from: task.status.to_string(),
                    to: "plan chat".to_string(),
                });
            }
            task.plan_messages.push(PlanMessage {
                role: PlanRole::User,
                content: message.to_string(),
                timestamp: Utc::now(),
            });
            Ok(())
        })?;
        self.publish_transcript_frame(&topic, PlanRole::User, message);

        let repo = self.store.data_dir().repo_dir(project_id);
        let prompt = compose_chat_prompt(&task, message);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forward = self.spawn_forwarder(topic.clone(), events_rx);
        let outcome = self
            .agent
            .invoke(AgentRequest {
                prompt,
                workdir: repo,
                timeout: self.timeout,
                events: Some(events_tx),
            })
            .await;
        let _ = forward.await;

        let reply = match outcome {
            Ok(outcome) => outcome.text,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "plan chat agent call failed");
                String::new()
            }
        };

        let updated = self.store.update_task(project_id, task_id, |task| {
            if !reply.is_empty() {
                task.plan = Some(reply.clone());
                task.plan_messages.push(PlanMessage {
                    role: PlanRole::Assistant,
                    content: reply.clone(),
                    timestamp: Utc::now(),
                });
            }
            Ok(())
        })?;
        if let Some(plan) = updated.plan.as_deref() {
            self.publish_transcript_frame(&topic, PlanRole::Assistant, plan);
        }
        Ok(updated)
    }

    /// Forward live agent events onto the plan topic until the stream ends.
    fn spawn_forwarder(
        &self,
        topic: String,
        mut events: mpsc::UnboundedReceiver<LogEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                bus.publish(&topic, event.to_value());
            }
        })
    }

    /// Publish a persisted conversation turn as one frame.
    fn publish_transcript_frame(&self, topic: &str, role: PlanRole, content: &str) {
        if content.is_empty() {
            return;
        }
        self.bus.publish(
            topic,
            serde_json::json!({
                "type": "plan_message",
                "role": match role {
                    PlanRole::Assistant => "assistant",
                    PlanRole::User => "user",
                },
                "content": content,
                "timestamp": Utc::now(),
            }),
        );
    }
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

/// Initial planning prompt.
fn compose_plan_prompt(task: &Task) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(
        "You are the planning assistant of a coding-agent orchestrator. A \
         separate agent will later execute this task in an isolated worktree; \
         your job now is ONLY to produce a plan.\n\n",
    );
    prompt.push_str(&format!("# Task\n\n{}\n\n", task.description.trim()));
    prompt.push_str(
        "Explore the repository first (read files, search) to understand the \
         code this task touches.\n\n\
         Then reply with:\n\
         1. A numbered step-by-step plan. Keep steps concrete: name files, \
         functions, and commands.\n\
         2. A section `## Questions` with the clarification questions you \
         would ask, each as a multiple-choice list where the FIRST option is \
         your recommended default.\n\n\
         Do not modify any files.\n",
    );
    prompt
}

/// Follow-up prompt carrying the conversation so far.
fn compose_chat_prompt(task: &Task, new_message: &str) -> String {
    let mut prompt = String::with_capacity(4096);
    prompt.push_str(
        "You are refining an execution plan for a coding task. Here is the \
         conversation so far; reply with the full REVISED plan (same format: \
         numbered steps, then `## Questions` if any remain).\n\n",
    );
    prompt.push_str(&format!("# Task\n\n{}\n\n# Conversation\n\n", task.description.trim()));
    for message in &task.plan_messages {
        let role = match message.role {
            PlanRole::Assistant => "Assistant",
            PlanRole::User => "User",
        };
        prompt.push_str(&format!("## {role}\n\n{}\n\n", message.content.trim()));
    }
    prompt.push_str(&format!("## User\n\n{}\n", new_message.trim()));
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_store::models::{NewProject, NewTask, Origin, ProjectStatus};
    use tempfile::TempDir;

    use crate::agent::AgentOutcome;

    /// Scripted agent returning canned text, optionally streaming it first.
    struct ScriptedAgent {
        reply: String,
        fail: bool,
    }

    #[async_trait]
    impl AgentInvoker for ScriptedAgent {
        async fn invoke(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError> {
            if self.fail {
                return Err(AgentError::Timeout(request.timeout));
            }
            if let Some(tx) = request.events {
                let _ = tx.send(LogEvent::Assistant {
                    text: self.reply.clone(),
                    timestamp: Utc::now(),
                });
            }
            Ok(AgentOutcome {
                text: self.reply.clone(),
                errors: Vec::new(),
            })
        }
    }

    fn setup(reply: &str, fail: bool) -> (TempDir, PlanService, String, String) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let project = store
            .create_project(NewProject {
                name: "p".to_string(),
                origin: Origin::New,
                auto_merge: false,
                auto_push: false,
            })
            .unwrap();
        store
            .update_project(&project.id, |p| p.status = ProjectStatus::Ready)
            .unwrap();
        let task = store
            .create_task(
                &project.id,
                NewTask {
                    description: "add auth".to_string(),
                    title: None,
                    priority: 0,
                    depends_on: None,
                    plan_mode: true,
                },
                "agent",
            )
            .unwrap();

        let bus = Arc::new(EventBus::new());
        let agent = Arc::new(ScriptedAgent {
            reply: reply.to_string(),
            fail,
        });
        let service = PlanService::new(store, bus, agent);
        (dir, service, project.id, task.id)
    }

    #[tokio::test]
    async fn generate_moves_to_plan_pending_and_persists_plan() {
        let (_dir, service, pid, tid) = setup("1. read code\n2. write code", false);
        let task = service.generate(&pid, &tid).await.unwrap();

        assert_eq!(task.status, TaskStatus::PlanPending);
        assert_eq!(task.plan.as_deref(), Some("1. read code\n2. write code"));
        assert_eq!(task.plan_messages.len(), 1);
        assert_eq!(task.plan_messages[0].role, PlanRole::Assistant);
    }

    #[tokio::test]
    async fn generate_streams_to_plan_topic() {
        let (_dir, service, pid, tid) = setup("the plan", false);
        service.generate(&pid, &tid).await.unwrap();

        let frames = service.bus.replay(&bus::topic_plan(&pid, &tid), 10);
        assert!(!frames.is_empty());
        assert!(
            frames
                .iter()
                .any(|f| f["type"] == "assistant" || f["type"] == "plan_message")
        );
    }

    #[tokio::test]
    async fn timeout_leaves_plan_pending_with_empty_plan() {
        let (_dir, service, pid, tid) = setup("", true);
        let task = service.generate(&pid, &tid).await.unwrap();
        assert_eq!(task.status, TaskStatus::PlanPending);
        assert!(task.plan.is_none());
        assert!(task.error.as_deref().unwrap_or("").contains("exceeded"));
    }

    #[tokio::test]
    async fn approve_records_answers_and_opens_gate() {
        let (_dir, service, pid, tid) = setup("plan", false);
        service.generate(&pid, &tid).await.unwrap();

        let answers = serde_json::json!({ "style": "concise" });
        let task = service.approve(&pid, &tid, Some(answers.clone())).unwrap();
        assert_eq!(task.status, TaskStatus::PlanApproved);
        assert!(task.plan_approved);
        assert_eq!(task.plan_answers, Some(answers));
    }

    #[tokio::test]
    async fn approve_before_generate_is_conflict() {
        let (_dir, service, pid, tid) = setup("plan", false);
        let err = service.approve(&pid, &tid, None).unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn reject_folds_feedback_into_description() {
        let (_dir, service, pid, tid) = setup("plan", false);
        service.generate(&pid, &tid).await.unwrap();

        let task = service.reject(&pid, &tid, Some("too vague")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.description.starts_with("[operator feedback] too vague"));
        assert!(task.description.contains("add auth"));
        assert!(!task.plan_approved);
    }

    #[tokio::test]
    async fn chat_appends_turns_and_updates_plan() {
        let (_dir, service, pid, tid) = setup("revised plan v2", false);
        service.generate(&pid, &tid).await.unwrap();

        let task = service.chat(&pid, &tid, "make step 2 smaller").await.unwrap();
        assert_eq!(task.plan.as_deref(), Some("revised plan v2"));
        // generate assistant + chat user + chat assistant
        assert_eq!(task.plan_messages.len(), 3);
        assert_eq!(task.plan_messages[1].role, PlanRole::User);
        assert_eq!(task.plan_messages[1].content, "make step 2 smaller");
    }

    #[tokio::test]
    async fn batch_reports_per_task_results() {
        let (_dir, service, pid, tid) = setup("plan", false);
        service.generate(&pid, &tid).await.unwrap();

        let results = service.batch(
            &pid,
            &[tid.clone(), "t-999999".to_string()],
            true,
            None,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].result.is_ok());
        assert!(results[1].result.as_ref().unwrap_err().is_not_found());
    }

    #[test]
    fn plan_prompt_contains_contract() {
        let (_dir, _service, _pid, _tid) = setup("x", false);
        let task = Task {
            id: "t-000001".to_string(),
            project_id: "p".to_string(),
            title: "t".to_string(),
            description: "implement the frobnicator".to_string(),
            priority: 0,
            depends_on: None,
            plan_mode: true,
            plan: None,
            plan_approved: false,
            plan_answers: None,
            plan_messages: Vec::new(),
            status: TaskStatus::PlanPending,
            worker_id: None,
            branch: "agent/t-000001".to_string(),
            commit_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let prompt = compose_plan_prompt(&task);
        assert!(prompt.contains("implement the frobnicator"));
        assert!(prompt.contains("## Questions"));
        assert!(prompt.contains("recommended default"));
        assert!(prompt.contains("Do not modify any files"));
    }
}
