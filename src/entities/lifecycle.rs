//! Ride lifecycle state machine.
//!
//! Every legal move is a row in [`TRANSITIONS`], keyed by `(from, event)`. A
//! pair absent from the table is rejected; there is no other way to change a
//! job's status.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    PendingBids,
    BidAccepted,
    DriverArriving,
    PickupArrived,
    Loading,
    InTransit,
    DropoffArrived,
    Completed,
    Cancelled,
    NoDriversAvailable,
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PendingBids => "PENDING_BIDS",
            Self::BidAccepted => "BID_ACCEPTED",
            Self::DriverArriving => "DRIVER_ARRIVING",
            Self::PickupArrived => "PICKUP_ARRIVED",
            Self::Loading => "LOADING",
            Self::InTransit => "IN_TRANSIT",
            Self::DropoffArrived => "DROPOFF_ARRIVED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::NoDriversAvailable => "NO_DRIVERS_AVAILABLE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::NoDriversAvailable
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    AcceptBid,
    Depart,
    ArriveAtPickup,
    StartLoading,
    StartTransit,
    ArriveAtDropoff,
    ConfirmDelivery,
    Cancel,
    ExhaustDispatch,
}

impl Event {
    /// The driver-reported event that moves a job into `status`, if the driver may report it.
    pub fn reported_by_driver(status: Status) -> Option<Event> {
        match status {
            Status::DriverArriving => Some(Self::Depart),
            Status::PickupArrived => Some(Self::ArriveAtPickup),
            Status::Loading => Some(Self::StartLoading),
            Status::InTransit => Some(Self::StartTransit),
            Status::DropoffArrived => Some(Self::ArriveAtDropoff),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Milestone {
    Accepted,
    PickupArrived,
    DropoffArrived,
    Completed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    Stamp(Milestone),
    NotifyCustomer,
    NotifyDriver,
}

#[derive(Debug)]
pub struct Transition {
    pub from: Status,
    pub event: Event,
    pub to: Status,
    pub effects: &'static [Effect],
}

const NOTIFY_BOTH: &[Effect] = &[Effect::NotifyCustomer, Effect::NotifyDriver];
const CANCELLED: &[Effect] = &[Effect::Stamp(Milestone::Cancelled)];

pub const TRANSITIONS: &[Transition] = &[
    Transition {
        from: Status::PendingBids,
        event: Event::AcceptBid,
        to: Status::BidAccepted,
        effects: &[Effect::Stamp(Milestone::Accepted)],
    },
    Transition {
        from: Status::PendingBids,
        event: Event::ExhaustDispatch,
        to: Status::NoDriversAvailable,
        effects: &[],
    },
    Transition {
        from: Status::BidAccepted,
        event: Event::Depart,
        to: Status::DriverArriving,
        effects: NOTIFY_BOTH,
    },
    Transition {
        from: Status::DriverArriving,
        event: Event::ArriveAtPickup,
        to: Status::PickupArrived,
        effects: &[
            Effect::Stamp(Milestone::PickupArrived),
            Effect::NotifyCustomer,
            Effect::NotifyDriver,
        ],
    },
    Transition {
        from: Status::PickupArrived,
        event: Event::StartLoading,
        to: Status::Loading,
        effects: NOTIFY_BOTH,
    },
    Transition {
        from: Status::Loading,
        event: Event::StartTransit,
        to: Status::InTransit,
        effects: NOTIFY_BOTH,
    },
    Transition {
        from: Status::InTransit,
        event: Event::ArriveAtDropoff,
        to: Status::DropoffArrived,
        effects: &[
            Effect::Stamp(Milestone::DropoffArrived),
            Effect::NotifyCustomer,
            Effect::NotifyDriver,
        ],
    },
    Transition {
        from: Status::DropoffArrived,
        event: Event::ConfirmDelivery,
        to: Status::Completed,
        effects: &[Effect::Stamp(Milestone::Completed)],
    },
    Transition {
        from: Status::PendingBids,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
    Transition {
        from: Status::BidAccepted,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
    Transition {
        from: Status::DriverArriving,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
    Transition {
        from: Status::PickupArrived,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
    Transition {
        from: Status::Loading,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
    Transition {
        from: Status::InTransit,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
    Transition {
        from: Status::DropoffArrived,
        event: Event::Cancel,
        to: Status::Cancelled,
        effects: CANCELLED,
    },
];

pub fn transition(from: Status, event: Event) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|transition| transition.from == from && transition.event == event)
}

#[test]
fn terminal_states_have_no_outgoing_transitions() {
    for transition in TRANSITIONS {
        assert!(
            !transition.from.is_terminal(),
            "{:?} leaves terminal state {:?}",
            transition.event,
            transition.from
        );
    }
}

#[test]
fn table_has_no_duplicate_keys() {
    for (i, a) in TRANSITIONS.iter().enumerate() {
        for b in TRANSITIONS.iter().skip(i + 1) {
            assert!(!(a.from == b.from && a.event == b.event), "{:?}", a);
        }
    }
}

#[test]
fn driver_events_walk_the_happy_path_in_order() {
    let path = [
        Status::BidAccepted,
        Status::DriverArriving,
        Status::PickupArrived,
        Status::Loading,
        Status::InTransit,
        Status::DropoffArrived,
    ];

    for pair in path.windows(2) {
        let event = Event::reported_by_driver(pair[1]).unwrap();
        assert_eq!(transition(pair[0], event).unwrap().to, pair[1]);
    }
}

#[test]
fn completion_is_not_driver_reportable() {
    assert!(Event::reported_by_driver(Status::Completed).is_none());
    assert!(Event::reported_by_driver(Status::Cancelled).is_none());
    assert!(Event::reported_by_driver(Status::BidAccepted).is_none());
}

#[test]
fn every_pre_completion_state_can_be_cancelled() {
    for status in [
        Status::PendingBids,
        Status::BidAccepted,
        Status::DriverArriving,
        Status::PickupArrived,
        Status::Loading,
        Status::InTransit,
        Status::DropoffArrived,
    ] {
        assert_eq!(
            transition(status, Event::Cancel).map(|t| t.to),
            Some(Status::Cancelled)
        );
    }
}
