//! In-memory repositories mirroring the transactional checks of the
//! Postgres implementations. One mutex guards the whole state, so every
//! check-then-insert sequence runs atomically, the way the Postgres
//! implementation serializes creates on the event row lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::booking::model::{
    Booking, BookingError, BookingStatus, Event, EventWithAvailability, NewBooking, NewEvent,
    NewUser, OverdueBooking, User,
};
use crate::clock::Clock;
use crate::store::{BookingRepository, EventRepository, UserRepository};

#[derive(Default)]
struct State {
    events: BTreeMap<i64, Event>,
    users: BTreeMap<i64, User>,
    bookings: BTreeMap<i64, Booking>,
    next_event_id: i64,
    next_user_id: i64,
    next_booking_id: i64,
}

impl State {
    fn confirmed_seats(&self, event_id: i64) -> i32 {
        self.bookings
            .values()
            .filter(|b| b.event_id == event_id && b.status == BookingStatus::Confirmed)
            .map(|b| b.seats)
            .sum()
    }

    /// Seats held by pending or confirmed bookings. Creation checks against
    /// this so that two requests racing for the last seats get exactly one
    /// winner.
    fn active_seats(&self, event_id: i64) -> i32 {
        self.bookings
            .values()
            .filter(|b| b.event_id == event_id && b.status.is_active())
            .map(|b| b.seats)
            .sum()
    }

    fn with_availability(&self, event: &Event) -> EventWithAvailability {
        let booked_seats = self.confirmed_seats(event.id);
        EventWithAvailability {
            event: event.clone(),
            booked_seats,
            available_seats: event.total_seats - booked_seats,
        }
    }
}

/// Single-process stand-in for the relational store.
pub struct MemoryDatabase {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl BookingRepository for MemoryDatabase {
    async fn create(&self, new: NewBooking) -> Result<Booking, BookingError> {
        let mut state = self.state.lock().unwrap();

        let total = state
            .events
            .get(&new.event_id)
            .map(|e| e.total_seats)
            .ok_or(BookingError::EventNotFound)?;

        let duplicate = state
            .bookings
            .values()
            .any(|b| b.event_id == new.event_id && b.user_id == new.user_id && b.status.is_active());
        if duplicate {
            return Err(BookingError::DuplicateBooking);
        }

        let available = total - state.active_seats(new.event_id);
        if new.seats > available {
            return Err(BookingError::InsufficientSeats {
                requested: new.seats,
                available,
            });
        }

        let now = self.clock.now();
        state.next_booking_id += 1;
        let booking = Booking {
            id: state.next_booking_id,
            event_id: new.event_id,
            user_id: new.user_id,
            seats: new.seats,
            status: BookingStatus::Pending,
            expires_at: now + Duration::minutes(i64::from(new.timeout_minutes)),
            reservation_timeout: new.timeout_minutes,
            created_at: now,
            updated_at: now,
        };
        state.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn get(&self, id: i64) -> Result<Booking, BookingError> {
        self.state
            .lock()
            .unwrap()
            .bookings
            .get(&id)
            .cloned()
            .ok_or(BookingError::BookingNotFound)
    }

    async fn get_active_by_event_and_user(
        &self,
        event_id: i64,
        user_id: i64,
    ) -> Result<Option<Booking>, BookingError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .bookings
            .values()
            .filter(|b| b.event_id == event_id && b.user_id == user_id && b.status.is_active())
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn update_status(&self, id: i64, status: BookingStatus) -> Result<(), BookingError> {
        let mut state = self.state.lock().unwrap();

        let (event_id, seats, current) = {
            let booking = state
                .bookings
                .get(&id)
                .ok_or(BookingError::BookingNotFound)?;
            (booking.event_id, booking.seats, booking.status)
        };

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(BookingError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        if current == BookingStatus::Pending && status == BookingStatus::Confirmed {
            let total = state
                .events
                .get(&event_id)
                .map(|e| e.total_seats)
                .ok_or(BookingError::EventNotFound)?;
            let confirmed = state.confirmed_seats(event_id);
            if confirmed + seats > total {
                return Err(BookingError::InsufficientSeats {
                    requested: seats,
                    available: total - confirmed,
                });
            }
        }

        let now = self.clock.now();
        let booking = state
            .bookings
            .get_mut(&id)
            .ok_or(BookingError::BookingNotFound)?;
        booking.status = status;
        booking.updated_at = now;
        Ok(())
    }

    async fn update_seats(&self, id: i64, seats: i32) -> Result<(), BookingError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let booking = state
            .bookings
            .get_mut(&id)
            .ok_or(BookingError::BookingNotFound)?;
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::Validation(
                "seat changes are only allowed while pending".to_string(),
            ));
        }
        booking.seats = seats;
        booking.updated_at = now;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), BookingError> {
        self.state
            .lock()
            .unwrap()
            .bookings
            .remove(&id)
            .map(|_| ())
            .ok_or(BookingError::BookingNotFound)
    }

    async fn list_by_event(&self, event_id: i64) -> Result<Vec<Booking>, BookingError> {
        let state = self.state.lock().unwrap();
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.event_id == event_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Booking>, BookingError> {
        let state = self.state.lock().unwrap();
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn list_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, BookingError> {
        let state = self.state.lock().unwrap();
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn list_overdue_pending(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<OverdueBooking>, BookingError> {
        let state = self.state.lock().unwrap();
        let mut overdue: Vec<OverdueBooking> = state
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.expires_at < before)
            .filter_map(|b| {
                let event = state.events.get(&b.event_id)?;
                let user = state.users.get(&b.user_id)?;
                Some(OverdueBooking {
                    booking_id: b.id,
                    event_id: b.event_id,
                    user_id: b.user_id,
                    seats: b.seats,
                    expires_at: b.expires_at,
                    event_title: event.title.clone(),
                    user_name: user.name.clone(),
                    messaging_id: user.messaging_id.clone(),
                })
            })
            .collect();
        overdue.sort_by_key(|b| b.expires_at);
        Ok(overdue)
    }
}

#[async_trait]
impl EventRepository for MemoryDatabase {
    async fn create(&self, new: NewEvent) -> Result<Event, BookingError> {
        let now = self.clock.now();
        if new.date <= now {
            return Err(BookingError::EventInPast);
        }
        if new.total_seats <= 0 {
            return Err(BookingError::Validation(
                "total seats must be positive".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        state.next_event_id += 1;
        let event = Event {
            id: state.next_event_id,
            title: new.title,
            description: new.description,
            date: new.date,
            total_seats: new.total_seats,
            created_at: now,
            updated_at: now,
        };
        state.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn get(&self, id: i64) -> Result<EventWithAvailability, BookingError> {
        let state = self.state.lock().unwrap();
        let event = state.events.get(&id).ok_or(BookingError::EventNotFound)?;
        Ok(state.with_availability(event))
    }

    async fn list(&self) -> Result<Vec<EventWithAvailability>, BookingError> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<EventWithAvailability> = state
            .events
            .values()
            .map(|e| state.with_availability(e))
            .collect();
        events.sort_by_key(|e| e.event.date);
        Ok(events)
    }

    async fn update(&self, event: &Event) -> Result<(), BookingError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let booked = state.confirmed_seats(event.id);
        if event.total_seats < booked {
            return Err(BookingError::SeatsBelowBooked { booked });
        }

        let stored = state
            .events
            .get_mut(&event.id)
            .ok_or(BookingError::EventNotFound)?;
        stored.title = event.title.clone();
        stored.description = event.description.clone();
        stored.date = event.date;
        stored.total_seats = event.total_seats;
        stored.updated_at = now;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), BookingError> {
        let mut state = self.state.lock().unwrap();
        if state.bookings.values().any(|b| b.event_id == id) {
            return Err(BookingError::EventHasBookings);
        }
        state
            .events
            .remove(&id)
            .map(|_| ())
            .ok_or(BookingError::EventNotFound)
    }
}

#[async_trait]
impl UserRepository for MemoryDatabase {
    async fn create(&self, new: NewUser) -> Result<User, BookingError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        if state.users.values().any(|u| u.email == new.email) {
            return Err(BookingError::DuplicateEmail(new.email));
        }

        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            email: new.email,
            name: new.name,
            messaging_id: new.messaging_id,
            created_at: now,
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get(&self, id: i64) -> Result<User, BookingError> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(&id)
            .cloned()
            .ok_or(BookingError::UserNotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, BookingError> {
        self.state
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(BookingError::UserNotFound)
    }

    async fn update(&self, user: &User) -> Result<(), BookingError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .users
            .get_mut(&user.id)
            .ok_or(BookingError::UserNotFound)?;
        stored.name = user.name.clone();
        stored.messaging_id = user.messaging_id.clone();
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), BookingError> {
        let mut state = self.state.lock().unwrap();
        if state
            .bookings
            .values()
            .any(|b| b.user_id == id && b.status.is_active())
        {
            return Err(BookingError::UserHasActiveBookings);
        }
        state
            .users
            .remove(&id)
            .map(|_| ())
            .ok_or(BookingError::UserNotFound)
    }
}
