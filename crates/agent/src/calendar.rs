//! Calendar availability, provider sync and team views on top of the cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use tandem_core::availability::find_free_slots;
use tandem_core::config::CalendarConfig;
use tandem_core::domain::calendar::{
    CalendarEvent, CalendarIntegration, CalendarSource, DateRange, TimeSlot,
};
use tandem_core::domain::identity::UserId;
use tandem_core::errors::DomainError;
use tandem_db::repositories::{AppointmentRepository, CalendarRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected the access token")]
    Unauthorized,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// External calendar backend (Google, Outlook). Real clients live outside
/// this crate.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn source(&self) -> CalendarSource;

    async fn fetch_events(
        &self,
        integration: &CalendarIntegration,
        range: &DateRange,
    ) -> Result<Vec<CalendarEvent>, ProviderError>;

    /// Exchanges the refresh token for a new access token.
    async fn refresh_token(
        &self,
        integration: &CalendarIntegration,
    ) -> Result<SecretString, ProviderError>;
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("duration must be positive, got {0} minutes")]
    InvalidDuration(i64),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no provider registered for `{}`", .0.as_str())]
    MissingProvider(CalendarSource),
    #[error(
        "{provider_name} sync failed for {owner}: {source}",
        provider_name = .provider.as_str()
    )]
    Provider {
        owner: UserId,
        provider: CalendarSource,
        #[source]
        source: ProviderError,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub success: bool,
    pub calendars_synced: u32,
    pub calendars_failed: u32,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct CalendarService {
    calendars: Arc<dyn CalendarRepository>,
    appointments: Arc<dyn AppointmentRepository>,
    providers: HashMap<CalendarSource, Arc<dyn CalendarProvider>>,
    sync_window: Duration,
    cache_ttl: Duration,
}

impl CalendarService {
    pub fn new(
        calendars: Arc<dyn CalendarRepository>,
        appointments: Arc<dyn AppointmentRepository>,
        config: &CalendarConfig,
    ) -> Self {
        Self {
            calendars,
            appointments,
            providers: HashMap::new(),
            sync_window: Duration::days(i64::from(config.sync_window_days)),
            cache_ttl: Duration::hours(i64::from(config.cache_ttl_hours)),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CalendarProvider>) -> Self {
        self.providers.insert(provider.source(), provider);
        self
    }

    /// Free slots for `owner_id` inside `range`, honouring cached external
    /// events, blocking appointments and the owner's preferences.
    pub async fn check_availability(
        &self,
        owner_id: &UserId,
        range: &DateRange,
        duration_minutes: i64,
    ) -> Result<Vec<TimeSlot>, CalendarError> {
        if duration_minutes <= 0 {
            return Err(CalendarError::InvalidDuration(duration_minutes));
        }
        let range = DateRange::new(range.start, range.end)?;
        let events = self.owner_events(owner_id, &range, Utc::now()).await?;
        let preferences = self.calendars.find_preferences(owner_id).await?.unwrap_or_default();

        Ok(find_free_slots(&events, &range, Duration::minutes(duration_minutes), &preferences))
    }

    /// Marks the integration disconnected and purges its cached events.
    /// Missing integrations and repeated calls are not errors.
    pub async fn disconnect_calendar(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
    ) -> Result<(), CalendarError> {
        let existed = self.calendars.disconnect(owner_id, provider, Utc::now()).await?;
        info!(
            event_name = "calendar.disconnected",
            owner_id = %owner_id,
            provider = provider.as_str(),
            existed,
        );
        Ok(())
    }

    /// Events of every practice peer who shares their calendar, keyed by peer.
    pub async fn team_calendars(
        &self,
        owner_id: &UserId,
        range: &DateRange,
    ) -> Result<BTreeMap<UserId, Vec<CalendarEvent>>, CalendarError> {
        let mut team = BTreeMap::new();
        let Some(own) = self.calendars.find_team_visibility(owner_id).await? else {
            return Ok(team);
        };

        let now = Utc::now();
        for peer in self.calendars.list_practice_members(&own.practice_id).await? {
            if &peer.owner_id == owner_id || !peer.share_with_team {
                continue;
            }
            let mut events = self.owner_events(&peer.owner_id, range, now).await?;
            if peer.show_busy_only {
                events.retain(|event| event.is_busy);
            }
            team.insert(peer.owner_id, events);
        }
        Ok(team)
    }

    pub async fn sync_owner(&self, owner_id: &UserId) -> Result<SyncSummary, CalendarError> {
        let integrations = self.calendars.list_connected_integrations(Some(owner_id)).await?;
        Ok(self.sync_integrations(integrations).await)
    }

    pub async fn sync_all(&self) -> Result<SyncSummary, CalendarError> {
        let integrations = self.calendars.list_connected_integrations(None).await?;
        Ok(self.sync_integrations(integrations).await)
    }

    async fn sync_integrations(&self, integrations: Vec<CalendarIntegration>) -> SyncSummary {
        let started = Instant::now();
        let mut summary = SyncSummary::default();

        for integration in integrations {
            match self.sync_integration(integration).await {
                Ok(()) => summary.calendars_synced += 1,
                Err(error) => {
                    warn!(event_name = "calendar.sync_failed", error = %error);
                    summary.calendars_failed += 1;
                    summary.errors.push(error.to_string());
                }
            }
        }

        summary.success = summary.calendars_failed == 0;
        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            event_name = "calendar.sync_completed",
            synced = summary.calendars_synced,
            failed = summary.calendars_failed,
            duration_ms = summary.duration_ms,
        );
        summary
    }

    async fn sync_integration(
        &self,
        mut integration: CalendarIntegration,
    ) -> Result<(), CalendarError> {
        let owner = integration.owner_id.clone();
        let source = integration.provider;
        let provider =
            self.providers.get(&source).ok_or(CalendarError::MissingProvider(source))?;
        let provider_error = |source_error: ProviderError| CalendarError::Provider {
            owner: owner.clone(),
            provider: source,
            source: source_error,
        };

        let now = Utc::now();
        let window = DateRange::new(now, now + self.sync_window)?;
        let events = match provider.fetch_events(&integration, &window).await {
            Err(ProviderError::Unauthorized) => {
                let access_token =
                    provider.refresh_token(&integration).await.map_err(provider_error)?;
                integration.access_token = access_token;
                self.calendars.save_integration(integration.clone()).await?;
                info!(
                    event_name = "calendar.token_refreshed",
                    owner_id = %owner,
                    provider = source.as_str(),
                );
                provider.fetch_events(&integration, &window).await.map_err(provider_error)?
            }
            other => other.map_err(provider_error)?,
        };

        let events: Vec<CalendarEvent> = events
            .into_iter()
            .map(|event| CalendarEvent { owner_id: owner.clone(), source, ..event })
            .collect();
        let count = events.len();
        self.calendars.replace_events(&owner, source, events, now, now + self.cache_ttl).await?;
        self.calendars.mark_synced(&owner, source, now).await?;
        info!(
            event_name = "calendar.synced",
            owner_id = %owner,
            provider = source.as_str(),
            events = count,
        );
        Ok(())
    }

    async fn owner_events(
        &self,
        owner_id: &UserId,
        range: &DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let mut events = self.calendars.list_events(owner_id, range, now).await?;
        events.extend(self.appointments.list_blocking(owner_id, range).await?.into_iter().map(
            |appointment| CalendarEvent {
                id: appointment.id.0,
                owner_id: appointment.therapist_id,
                title: "Appointment".to_string(),
                start: appointment.start,
                end: appointment.end,
                is_busy: true,
                source: CalendarSource::Internal,
            },
        ));
        events.sort_by(|left, right| (left.start, left.end).cmp(&(right.start, right.end)));
        Ok(events)
    }
}
