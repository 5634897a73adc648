//! Domain event identifiers and the codes carried by each event.
//!
//! Numeric values follow libvirt so that events coming from a real
//! hypervisor can be passed through unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Category of domain event a callback subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventId {
    /// Domain started, stopped, suspended, defined...
    Lifecycle,
    /// Guest-initiated reboot
    Reboot,
    /// Guest RTC adjusted
    RtcChange,
    /// Watchdog device fired
    Watchdog,
    /// Disk I/O error
    IoError,
    /// Graphics client connected or disconnected
    Graphics,
    /// Disk I/O error with a reason string
    IoErrorReason,
    /// Monitor or agent control channel failed
    ControlError,
}

impl EventId {
    pub const ALL: [EventId; 8] = [
        EventId::Lifecycle,
        EventId::Reboot,
        EventId::RtcChange,
        EventId::Watchdog,
        EventId::IoError,
        EventId::Graphics,
        EventId::IoErrorReason,
        EventId::ControlError,
    ];

    /// Numeric event id.
    pub fn code(&self) -> i32 {
        match self {
            EventId::Lifecycle => 0,
            EventId::Reboot => 1,
            EventId::RtcChange => 2,
            EventId::Watchdog => 3,
            EventId::IoError => 4,
            EventId::Graphics => 5,
            EventId::IoErrorReason => 6,
            EventId::ControlError => 7,
        }
    }

    /// Name used in configuration files and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            EventId::Lifecycle => "lifecycle",
            EventId::Reboot => "reboot",
            EventId::RtcChange => "rtc-change",
            EventId::Watchdog => "watchdog",
            EventId::IoError => "io-error",
            EventId::Graphics => "graphics",
            EventId::IoErrorReason => "io-error-reason",
            EventId::ControlError => "control-error",
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<i32> for EventId {
    type Error = ConnectError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        EventId::ALL
            .into_iter()
            .find(|id| id.code() == code)
            .ok_or_else(|| ConnectError::InvalidArgument(format!("invalid event ID {}", code)))
    }
}

/// Accepts either an event name (`lifecycle`, `io_error`, `IO-ERROR`) or a
/// numeric id.
///
/// An unknown number is an invalid argument; anything that is neither a
/// known name nor a number is the wrong kind of argument.
impl FromStr for EventId {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        if let Some(id) = EventId::ALL.into_iter().find(|id| id.name() == normalized) {
            return Ok(id);
        }
        match normalized.parse::<i32>() {
            Ok(code) => EventId::try_from(code),
            Err(_) => Err(ConnectError::WrongType(format!(
                "expected event name or integer, got '{}'",
                s
            ))),
        }
    }
}

macro_rules! event_codes {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Numeric code.
            pub fn code(&self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Look up a value by its numeric code.
            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Short lowercase label for logs.
            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

event_codes! {
    /// Event code of a lifecycle notification.
    LifecycleEvent {
        Defined = 0 => "defined",
        Undefined = 1 => "undefined",
        Started = 2 => "started",
        Suspended = 3 => "suspended",
        Resumed = 4 => "resumed",
        Stopped = 5 => "stopped",
        Shutdown = 6 => "shutdown",
        PmSuspended = 7 => "pmsuspended",
    }
}

event_codes! {
    /// Detail of a `Defined` lifecycle event.
    DefinedDetail {
        Added = 0 => "added",
        Updated = 1 => "updated",
    }
}

event_codes! {
    /// Detail of an `Undefined` lifecycle event.
    UndefinedDetail {
        Removed = 0 => "removed",
    }
}

event_codes! {
    /// Detail of a `Started` lifecycle event.
    StartedDetail {
        Booted = 0 => "booted",
        Migrated = 1 => "migrated",
        Restored = 2 => "restored",
        FromSnapshot = 3 => "from snapshot",
        Wakeup = 4 => "wakeup",
    }
}

event_codes! {
    /// Detail of a `Suspended` lifecycle event.
    SuspendedDetail {
        Paused = 0 => "paused",
        Migrated = 1 => "migrated",
        IoError = 2 => "io error",
        Watchdog = 3 => "watchdog",
        Restored = 4 => "restored",
        FromSnapshot = 5 => "from snapshot",
    }
}

event_codes! {
    /// Detail of a `Resumed` lifecycle event.
    ResumedDetail {
        Unpaused = 0 => "unpaused",
        Migrated = 1 => "migrated",
        FromSnapshot = 2 => "from snapshot",
    }
}

event_codes! {
    /// Detail of a `Stopped` lifecycle event.
    StoppedDetail {
        Shutdown = 0 => "shutdown",
        Destroyed = 1 => "destroyed",
        Crashed = 2 => "crashed",
        Migrated = 3 => "migrated",
        Saved = 4 => "saved",
        Failed = 5 => "failed",
        FromSnapshot = 6 => "from snapshot",
    }
}

event_codes! {
    /// Action taken when a watchdog fires (event code of `Watchdog`).
    WatchdogAction {
        None = 0 => "none",
        Pause = 1 => "pause",
        Reset = 2 => "reset",
        Poweroff = 3 => "poweroff",
        Shutdown = 4 => "shutdown",
        Debug = 5 => "debug",
    }
}

event_codes! {
    /// Action taken on a disk I/O error (event code of `IoError`).
    IoErrorAction {
        None = 0 => "none",
        Pause = 1 => "pause",
        Report = 2 => "report",
    }
}

event_codes! {
    /// Phase of a graphics client session (event code of `Graphics`).
    GraphicsPhase {
        Connect = 0 => "connect",
        Initialize = 1 => "initialize",
        Disconnect = 2 => "disconnect",
    }
}

fn lifecycle_detail_label(event: LifecycleEvent, detail: i32) -> Option<&'static str> {
    match event {
        LifecycleEvent::Defined => DefinedDetail::from_code(detail).map(|d| d.label()),
        LifecycleEvent::Undefined => UndefinedDetail::from_code(detail).map(|d| d.label()),
        LifecycleEvent::Started => StartedDetail::from_code(detail).map(|d| d.label()),
        LifecycleEvent::Suspended => SuspendedDetail::from_code(detail).map(|d| d.label()),
        LifecycleEvent::Resumed => ResumedDetail::from_code(detail).map(|d| d.label()),
        LifecycleEvent::Stopped => StoppedDetail::from_code(detail).map(|d| d.label()),
        LifecycleEvent::Shutdown => (detail == 0).then_some("finished"),
        LifecycleEvent::PmSuspended => (detail == 0).then_some("memory"),
    }
}

/// Human-readable description of an event, e.g. `"stopped (crashed)"`.
///
/// Unknown codes are rendered numerically rather than rejected, since a
/// newer hypervisor may send codes this crate does not know yet.
pub fn describe_event(event_id: EventId, event: i32, detail: i32) -> String {
    match event_id {
        EventId::Lifecycle => match LifecycleEvent::from_code(event) {
            Some(lifecycle) => match lifecycle_detail_label(lifecycle, detail) {
                Some(label) => format!("{} ({})", lifecycle, label),
                None => format!("{} (detail {})", lifecycle, detail),
            },
            None => format!("lifecycle event {} (detail {})", event, detail),
        },
        EventId::Reboot => "reboot".to_string(),
        EventId::RtcChange => format!("rtc change (utc offset {}s)", detail),
        EventId::Watchdog => match WatchdogAction::from_code(event) {
            Some(action) => format!("watchdog ({})", action),
            None => format!("watchdog action {}", event),
        },
        EventId::IoError | EventId::IoErrorReason => match IoErrorAction::from_code(event) {
            Some(action) => format!("{} ({})", event_id, action),
            None => format!("{} action {}", event_id, event),
        },
        EventId::Graphics => match GraphicsPhase::from_code(event) {
            Some(phase) => format!("graphics {}", phase),
            None => format!("graphics phase {}", event),
        },
        EventId::ControlError => "control error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_event_id_from_code() {
        assert_eq!(EventId::try_from(0).unwrap(), EventId::Lifecycle);
        assert_eq!(EventId::try_from(5).unwrap(), EventId::Graphics);

        let err = EventId::try_from(456789).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(err.to_string(), "invalid event ID 456789");
    }

    #[test]
    fn test_event_id_from_str() {
        assert_eq!("lifecycle".parse::<EventId>().unwrap(), EventId::Lifecycle);
        assert_eq!("IO_ERROR".parse::<EventId>().unwrap(), EventId::IoError);
        assert_eq!("rtc-change".parse::<EventId>().unwrap(), EventId::RtcChange);
        assert_eq!("3".parse::<EventId>().unwrap(), EventId::Watchdog);

        assert_eq!("456789".parse::<EventId>().unwrap_err().kind(), ErrorKind::Argument);
        assert_eq!("hello".parse::<EventId>().unwrap_err().kind(), ErrorKind::Type);
    }

    #[test]
    fn test_codes_are_consistent() {
        for id in EventId::ALL {
            assert_eq!(EventId::try_from(id.code()).unwrap(), id);
            assert_eq!(id.name().parse::<EventId>().unwrap(), id);
        }
        assert_eq!(StoppedDetail::from_code(2), Some(StoppedDetail::Crashed));
        assert_eq!(LifecycleEvent::Stopped.code(), 5);
        assert_eq!(LifecycleEvent::from_code(42), None);
    }

    #[test]
    fn test_describe_event() {
        assert_eq!(
            describe_event(EventId::Lifecycle, LifecycleEvent::Stopped.code(), StoppedDetail::Crashed.code()),
            "stopped (crashed)"
        );
        assert_eq!(describe_event(EventId::Lifecycle, 2, 99), "started (detail 99)");
        assert_eq!(describe_event(EventId::Watchdog, 2, 0), "watchdog (reset)");
        assert_eq!(describe_event(EventId::Graphics, 9, 0), "graphics phase 9");
    }
}
