use core::fmt;

use crate::sync::Locked;

const MAX_COMPONENTS: usize = 8;

/// Kernel initialization status tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed(&'static str),
}

/// Kernel component status
#[derive(Debug, Clone, Copy)]
pub struct ComponentStatus {
    pub name: &'static str,
    pub status: InitStatus,
}

struct Components {
    entries: [Option<ComponentStatus>; MAX_COMPONENTS],
}

static INIT_STATUS: Locked<Components> = Locked::new(Components {
    entries: [None; MAX_COMPONENTS],
});

impl ComponentStatus {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            status: InitStatus::NotStarted,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, InitStatus::Failed(_))
    }
}

/// Track kernel component initialization. Registering a known name again
/// resets it; names beyond capacity are dropped.
pub fn register_component(name: &'static str) {
    let mut components = INIT_STATUS.lock();
    let slot = components
        .entries
        .iter_mut()
        .find(|entry| entry.map_or(true, |c| c.name == name));
    if let Some(slot) = slot {
        *slot = Some(ComponentStatus::new(name));
    }
}

/// Update component status
pub fn update_component_status(name: &'static str, status: InitStatus) {
    let mut components = INIT_STATUS.lock();
    if let Some(component) = components.entries.iter_mut().flatten().find(|c| c.name == name) {
        component.status = status;
    }
}

pub fn component_status(name: &str) -> Option<InitStatus> {
    INIT_STATUS
        .lock()
        .entries
        .iter()
        .flatten()
        .find(|c| c.name == name)
        .map(|c| c.status)
}

/// Log one line per registered component.
pub fn report() {
    for component in INIT_STATUS.lock().entries.iter().flatten() {
        if component.is_failed() {
            log::error!("  {:<20} {}", component.name, component.status);
        } else {
            log::info!("  {:<20} {}", component.name, component.status);
        }
    }
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStatus::NotStarted => write!(f, "Not Started"),
            InitStatus::InProgress => write!(f, "In Progress"),
            InitStatus::Completed => write!(f, "Completed"),
            InitStatus::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The table is global; each test uses its own names.

    #[test]
    fn status_follows_updates() {
        register_component("test-a");
        assert_eq!(component_status("test-a"), Some(InitStatus::NotStarted));
        update_component_status("test-a", InitStatus::Failed("boom"));
        assert_eq!(component_status("test-a"), Some(InitStatus::Failed("boom")));
        register_component("test-a");
        assert_eq!(component_status("test-a"), Some(InitStatus::NotStarted));
    }

    #[test]
    fn unknown_names_are_ignored() {
        update_component_status("test-missing", InitStatus::Completed);
        assert_eq!(component_status("test-missing"), None);
    }

    #[test]
    fn display() {
        assert_eq!(std::format!("{}", InitStatus::Failed("x")), "Failed: x");
        assert_eq!(std::format!("{}", InitStatus::Completed), "Completed");
    }
}
