use ulid::Ulid;

use crate::model::*;

/// All appointments of one tenant, sorted by `span.start`.
#[derive(Debug, Default)]
pub struct Calendar {
    appointments: Vec<Appointment>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Appointment> {
        self.appointments.iter()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == *id)?;
        Some(self.appointments.remove(pos))
    }

    /// Replace an appointment, re-sorting if its start moved.
    pub fn upsert(&mut self, appointment: Appointment) {
        self.remove(&appointment.id);
        self.insert(appointment);
    }

    /// Appointments whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.overlaps(query))
    }

    /// Appointments starting inside `window`.
    pub fn starting_within(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        let left = self
            .appointments
            .partition_point(|a| a.span.start < window.start);
        let right = self
            .appointments
            .partition_point(|a| a.span.start < window.end);
        self.appointments[left..right].iter()
    }

    /// Number of capacity-holding appointments overlapping `span`,
    /// optionally ignoring one appointment (the one being moved).
    pub fn count_overlapping(&self, span: &Span, exclude: Option<Ulid>) -> usize {
        self.overlapping(span)
            .filter(|a| a.status.kind().holds_capacity())
            .filter(|a| Some(a.id) != exclude)
            .count()
    }
}
