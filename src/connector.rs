//! Per-connector state (C7): status, availability, authorization,
//! transaction lifecycle, energy counters, reservation and charging profiles.
//!
//! Connector 0 is the station-wide virtual connector: always `Operative`,
//! never holds a transaction.

use chrono::{DateTime, Utc};

/// Connector status, mirroring the OCPP 1.6 `ChargePointStatus` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl Default for ConnectorStatus {
    fn default() -> Self {
        Self::Available
    }
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEV => "SuspendedEV",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }
}

/// Administrative availability, distinct from operational `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Operative,
    Inoperative,
}

impl Default for Availability {
    fn default() -> Self {
        Self::Operative
    }
}

/// A time-phased power/current limit (used by the MeterValues power-limit hook).
#[derive(Debug, Clone)]
pub struct ChargingProfile {
    pub kind: ChargingProfileKindType,
    pub purpose: ChargingProfilePurposeType,
    pub stack_level: u32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub schedule: ChargingSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingProfileKindType {
    Absolute,
    Recurring,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingProfilePurposeType {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingRateUnit {
    W,
    A,
}

#[derive(Debug, Clone, Copy)]
pub struct ChargingSchedulePeriod {
    /// Seconds from the start of the schedule.
    pub start_period: u32,
    pub limit: f64,
}

#[derive(Debug, Clone)]
pub struct ChargingSchedule {
    pub start_schedule: Option<DateTime<Utc>>,
    pub duration: Option<u32>,
    pub charging_rate_unit: ChargingRateUnit,
    pub periods: Vec<ChargingSchedulePeriod>,
}

/// Validation/construction errors for a [`ChargingProfile`].
#[derive(Debug, thiserror::Error)]
pub enum ChargingProfileError {
    #[error("RECURRING profile requires a recurrencyKind and startSchedule")]
    MissingRecurrenceFields,
    #[error("schedule has no periods")]
    EmptySchedule,
}

impl ChargingProfile {
    /// Construct a profile, sorting schedule periods by `start_period` and
    /// validating the invariants from spec.md §3: periods sorted with the
    /// first at `start_period == 0`; RECURRING requires a recurrence kind
    /// and `start_schedule`.
    pub fn new(
        kind: ChargingProfileKindType,
        purpose: ChargingProfilePurposeType,
        stack_level: u32,
        valid_from: Option<DateTime<Utc>>,
        valid_to: Option<DateTime<Utc>>,
        mut schedule: ChargingSchedule,
        recurrency_kind: Option<RecurrencyKind>,
    ) -> Result<Self, ChargingProfileError> {
        if schedule.periods.is_empty() {
            return Err(ChargingProfileError::EmptySchedule);
        }
        schedule.periods.sort_by_key(|p| p.start_period);
        if schedule.periods[0].start_period != 0 {
            schedule.periods[0].start_period = 0;
        }
        if matches!(kind, ChargingProfileKindType::Recurring)
            && (recurrency_kind.is_none() || schedule.start_schedule.is_none())
        {
            return Err(ChargingProfileError::MissingRecurrenceFields);
        }
        Ok(Self {
            kind,
            purpose,
            stack_level,
            valid_from,
            valid_to,
            schedule,
        })
    }

    /// The power/current limit in effect `elapsed_secs` after the schedule start.
    pub fn limit_at(&self, elapsed_secs: u32) -> Option<f64> {
        self.schedule
            .periods
            .iter()
            .rev()
            .find(|p| p.start_period <= elapsed_secs)
            .map(|p| p.limit)
    }
}

/// An active reservation on a connector.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: i64,
    pub id_tag: String,
    pub expiry_date: DateTime<Utc>,
}

/// Per-connector runtime state.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u32,
    pub availability: Availability,
    pub status: ConnectorStatus,

    // Authorization trio.
    pub id_tag_local_authorized: bool,
    pub id_tag_authorized: bool,
    pub local_authorize_id_tag: Option<String>,
    pub authorize_id_tag: Option<String>,

    // Transaction trio.
    pub transaction_remote_started: bool,
    pub transaction_started: bool,
    pub transaction_id: Option<i64>,
    pub transaction_id_tag: Option<String>,
    pub transaction_start: Option<DateTime<Utc>>,
    pub transaction_begin_meter_value: Option<i64>,

    // Energy counters (Wh).
    pub energy_active_import_register_value: i64,
    pub transaction_energy_active_import_register_value: i64,

    pub reservation: Option<Reservation>,
    pub charging_profiles: Vec<ChargingProfile>,

    /// A pending ChangeAvailability not yet applied because a transaction
    /// is active (spec.md §9(c)): applied when the transaction ends.
    pub scheduled_availability: Option<Availability>,
}

impl Connector {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            availability: Availability::Operative,
            status: ConnectorStatus::Available,
            id_tag_local_authorized: false,
            id_tag_authorized: false,
            local_authorize_id_tag: None,
            authorize_id_tag: None,
            transaction_remote_started: false,
            transaction_started: false,
            transaction_id: None,
            transaction_id_tag: None,
            transaction_start: None,
            transaction_begin_meter_value: None,
            energy_active_import_register_value: 0,
            transaction_energy_active_import_register_value: 0,
            reservation: None,
            charging_profiles: Vec::new(),
            scheduled_availability: None,
        }
    }

    /// Connector 0 is always Operative and never holds a transaction.
    pub fn is_virtual(&self) -> bool {
        self.id == 0
    }

    pub fn has_active_transaction(&self) -> bool {
        self.transaction_started && self.transaction_id.is_some()
    }

    /// Clear all transaction-scoped fields together (spec.md §3 invariant).
    pub fn clear_transaction(&mut self) {
        self.transaction_remote_started = false;
        self.transaction_started = false;
        self.transaction_id = None;
        self.transaction_id_tag = None;
        self.transaction_start = None;
        self.transaction_begin_meter_value = None;
        self.transaction_energy_active_import_register_value = 0;

        if let Some(pending) = self.scheduled_availability.take() {
            self.availability = pending;
        }
    }

    pub fn begin_transaction(&mut self, transaction_id: i64, id_tag: &str, meter_value: i64) {
        self.transaction_remote_started = false;
        self.transaction_started = true;
        self.transaction_id = Some(transaction_id);
        self.transaction_id_tag = Some(id_tag.to_string());
        self.transaction_start = Some(Utc::now());
        self.transaction_begin_meter_value = Some(meter_value);
        self.transaction_energy_active_import_register_value = 0;
    }

    /// Request availability change. Applied immediately unless a
    /// transaction is active, in which case it is scheduled for when the
    /// transaction ends (spec.md §9(c), §4.5).
    pub fn request_availability(&mut self, availability: Availability) -> bool {
        if self.has_active_transaction() {
            self.scheduled_availability = Some(availability);
            false
        } else {
            self.availability = availability;
            if matches!(availability, Availability::Inoperative) {
                self.status = ConnectorStatus::Unavailable;
            }
            true
        }
    }

    /// Record an energy sample, enforcing monotonic non-decrease within a
    /// transaction (spec.md §8 testable property).
    pub fn record_energy_sample(&mut self, total_wh: i64) {
        let total_wh = total_wh.max(self.energy_active_import_register_value);
        self.energy_active_import_register_value = total_wh;
        if self.transaction_started {
            let delta = total_wh - self.transaction_begin_meter_value.unwrap_or(total_wh);
            self.transaction_energy_active_import_register_value = delta.max(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_zero_is_virtual() {
        let c = Connector::new(0);
        assert!(c.is_virtual());
        assert_eq!(c.availability, Availability::Operative);
    }

    #[test]
    fn clearing_transaction_clears_all_fields_together() {
        let mut c = Connector::new(1);
        c.begin_transaction(42, "TAG1", 1000);
        assert!(c.has_active_transaction());
        c.clear_transaction();
        assert!(!c.transaction_started);
        assert!(c.transaction_id.is_none());
        assert!(c.transaction_id_tag.is_none());
    }

    #[test]
    fn availability_change_during_transaction_is_scheduled_not_immediate() {
        let mut c = Connector::new(1);
        c.begin_transaction(1, "TAG", 0);
        let applied = c.request_availability(Availability::Inoperative);
        assert!(!applied);
        assert_eq!(c.availability, Availability::Operative);
        c.clear_transaction();
        assert_eq!(c.availability, Availability::Inoperative);
    }

    #[test]
    fn energy_register_is_monotonic() {
        let mut c = Connector::new(1);
        c.record_energy_sample(100);
        c.record_energy_sample(50);
        assert_eq!(c.energy_active_import_register_value, 100);
        c.record_energy_sample(150);
        assert_eq!(c.energy_active_import_register_value, 150);
    }

    #[test]
    fn charging_profile_requires_recurrence_fields() {
        let schedule = ChargingSchedule {
            start_schedule: None,
            duration: None,
            charging_rate_unit: ChargingRateUnit::W,
            periods: vec![ChargingSchedulePeriod {
                start_period: 0,
                limit: 32.0,
            }],
        };
        let result = ChargingProfile::new(
            ChargingProfileKindType::Recurring,
            ChargingProfilePurposeType::TxProfile,
            0,
            None,
            None,
            schedule,
            None,
        );
        assert!(matches!(
            result,
            Err(ChargingProfileError::MissingRecurrenceFields)
        ));
    }

    #[test]
    fn charging_profile_sorts_periods_and_forces_zero_start() {
        let schedule = ChargingSchedule {
            start_schedule: None,
            duration: None,
            charging_rate_unit: ChargingRateUnit::A,
            periods: vec![
                ChargingSchedulePeriod {
                    start_period: 100,
                    limit: 16.0,
                },
                ChargingSchedulePeriod {
                    start_period: 10,
                    limit: 32.0,
                },
            ],
        };
        let profile = ChargingProfile::new(
            ChargingProfileKindType::Absolute,
            ChargingProfilePurposeType::TxDefaultProfile,
            0,
            None,
            None,
            schedule,
            None,
        )
        .unwrap();
        assert_eq!(profile.schedule.periods[0].start_period, 0);
        assert_eq!(profile.limit_at(50), Some(32.0));
        assert_eq!(profile.limit_at(150), Some(16.0));
    }
}
