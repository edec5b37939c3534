//! Incident persistence.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::{
    infer_root_cause, DigestIncident, IncidentDigestSummary, IncidentRecord, IncidentSeverity, NewIncident,
    PostMortem, PostMortemImpact, PostMortemTimeline,
};
use crate::core::{StageName, DEFAULT_CRITICAL_STAGES};
use crate::errors::NexusError;
use crate::state::{DocumentStore, Filter};

/// Collection holding incident records.
pub const INCIDENTS_COLLECTION: &str = "incidents";

const COMPONENT: &str = "incidents";

/// Logs, resolves and summarizes incidents.
#[derive(Debug, Clone)]
pub struct IncidentLogger {
    store: Arc<dyn DocumentStore>,
}

fn post_mortem(incident: &NewIncident, detected: chrono::DateTime<Utc>) -> PostMortem {
    let critical_stage = incident
        .stage
        .parse::<StageName>()
        .is_ok_and(|s| DEFAULT_CRITICAL_STAGES.contains(&s));
    let potential_video_impact = if critical_stage {
        "Video production blocked; today's video may be skipped"
    } else {
        "Non-critical stage; video may publish with reduced functionality"
    };

    PostMortem {
        timeline: PostMortemTimeline {
            detected,
            impact: format!("Pipeline {} halted at {}", incident.pipeline_id, incident.stage),
        },
        summary: format!(
            "{} in {}: {}",
            incident.error.code, incident.stage, incident.error.message
        ),
        impact: PostMortemImpact {
            pipeline_affected: incident.pipeline_id.clone(),
            stage_affected: incident.stage.clone(),
            potential_video_impact: potential_video_impact.to_string(),
        },
        root_cause_analysis: "TBD".to_string(),
        action_items: Vec::new(),
        lessons_learned: "TBD".to_string(),
    }
}

impl IncidentLogger {
    /// Creates a logger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persists a new open incident and returns its id.
    ///
    /// The sequence number comes from counting the day's incidents before
    /// writing, so two concurrent calls for the same date can collide.
    /// CRITICAL incidents get a post-mortem template; alerting on them is
    /// left to the caller.
    pub async fn log_incident(&self, incident: NewIncident) -> Result<String, NexusError> {
        let now = Utc::now();
        let start_time = incident.start_time.unwrap_or(now);
        let date = start_time.format("%Y-%m-%d").to_string();

        let existing = self
            .store
            .query(INCIDENTS_COLLECTION, &[Filter::eq("date", date.as_str())])
            .await?
            .len();
        let id = format!("{date}-{:03}", existing + 1);

        let post_mortem = (incident.severity == IncidentSeverity::Critical).then(|| post_mortem(&incident, start_time));
        let record = IncidentRecord {
            id: id.clone(),
            date,
            root_cause: infer_root_cause(&incident.error.code),
            pipeline_id: incident.pipeline_id,
            stage: incident.stage,
            error: incident.error,
            severity: incident.severity,
            start_time,
            end_time: None,
            duration: None,
            context: incident.context,
            is_open: true,
            resolution: None,
            post_mortem,
            created_at: now,
            updated_at: now,
        };

        self.store
            .set(INCIDENTS_COLLECTION, &id, serde_json::to_value(&record)?)
            .await?;

        tracing::info!(
            incident_id = %id,
            pipeline_id = %record.pipeline_id,
            stage = %record.stage,
            severity = %record.severity,
            root_cause = %record.root_cause,
            "Incident logged"
        );
        Ok(id)
    }

    /// Closes an open incident.
    pub async fn resolve_incident(&self, id: &str, resolution: &str) -> Result<IncidentRecord, NexusError> {
        let mut record = self.get_incident(id).await?.ok_or_else(|| {
            NexusError::critical("INCIDENT_NOT_FOUND", format!("Incident '{id}' not found"), COMPONENT)
                .with_context_entry("id", id)
        })?;
        if !record.is_open {
            return Err(NexusError::critical(
                "INCIDENT_ALREADY_RESOLVED",
                format!("Incident '{id}' is already resolved"),
                COMPONENT,
            ));
        }

        let end_time = Utc::now();
        let duration = u64::try_from((end_time - record.start_time).num_milliseconds()).unwrap_or(0);
        record.is_open = false;
        record.end_time = Some(end_time);
        record.duration = Some(duration);
        record.resolution = Some(resolution.to_string());
        record.updated_at = end_time;

        let mut patch = Map::new();
        patch.insert("isOpen".to_string(), Value::Bool(false));
        patch.insert("endTime".to_string(), serde_json::to_value(end_time)?);
        patch.insert("duration".to_string(), Value::from(duration));
        patch.insert("resolution".to_string(), Value::from(resolution));
        patch.insert("updatedAt".to_string(), serde_json::to_value(end_time)?);
        self.store.update(INCIDENTS_COLLECTION, id, patch).await?;

        tracing::info!(incident_id = id, duration_ms = duration, "Incident resolved");
        Ok(record)
    }

    /// Reads an incident.
    pub async fn get_incident(&self, id: &str) -> Result<Option<IncidentRecord>, NexusError> {
        match self.store.get(INCIDENTS_COLLECTION, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Incidents detected on `date` (`YYYY-MM-DD`), in id order.
    pub async fn get_incidents_by_date(&self, date: &str) -> Result<Vec<IncidentRecord>, NexusError> {
        self.query(&[Filter::eq("date", date)]).await
    }

    /// Every open incident, in id order.
    pub async fn get_open_incidents(&self) -> Result<Vec<IncidentRecord>, NexusError> {
        self.query(&[Filter::eq("isOpen", true)]).await
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<IncidentRecord>, NexusError> {
        self.store
            .query(INCIDENTS_COLLECTION, filters)
            .await?
            .into_iter()
            .map(|(_, doc)| serde_json::from_value(doc).map_err(NexusError::from))
            .collect()
    }

    /// Aggregates the day's incidents for the daily digest.
    pub async fn get_incident_summary_for_digest(&self, date: &str) -> Result<IncidentDigestSummary, NexusError> {
        let incidents = self.get_incidents_by_date(date).await?;

        let count = |severity: IncidentSeverity| incidents.iter().filter(|i| i.severity == severity).count();

        let mut stages_affected: Vec<String> = Vec::new();
        for incident in &incidents {
            if !stages_affected.contains(&incident.stage) {
                stages_affected.push(incident.stage.clone());
            }
        }

        let durations: Vec<u64> = incidents.iter().filter_map(|i| i.duration).collect();
        #[allow(clippy::cast_precision_loss)]
        let avg_resolution_time_ms =
            (!durations.is_empty()).then(|| durations.iter().sum::<u64>() as f64 / durations.len() as f64);

        Ok(IncidentDigestSummary {
            date: date.to_string(),
            total_count: incidents.len(),
            critical_count: count(IncidentSeverity::Critical),
            warning_count: count(IncidentSeverity::Warning),
            recoverable_count: count(IncidentSeverity::Recoverable),
            stages_affected,
            avg_resolution_time_ms,
            open_incidents: incidents.iter().filter(|i| i.is_open).count(),
            incidents: incidents
                .iter()
                .map(|i| DigestIncident {
                    id: i.id.clone(),
                    stage: i.stage.clone(),
                    severity: i.severity,
                    code: i.error.code.clone(),
                    message: i.error.message.clone(),
                    root_cause: i.root_cause,
                    is_open: i.is_open,
                    duration: i.duration,
                })
                .collect(),
        })
    }
}
