//! Foldable display-mode manager.
//!
//! Same table shape as the power machine but driven by sensor readings, so
//! an event with no entry for the current status is dropped quietly and
//! there are no timeouts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::display::wire_enum;

wire_enum! {
    pub enum SuperFoldStatus {
        Unknown = 0,
        Folded = 1,
        HalfFolded = 2,
        Expanded = 3,
        Keyboard = 4,
        SoftKeyboard = 5,
    }
}

wire_enum! {
    pub enum SuperFoldStatusChangeEvent {
        AngleChangeExpanded = 1,
        AngleChangeHalfFolded = 2,
        AngleChangeFolded = 3,
        KeyboardOn = 4,
        KeyboardOff = 5,
        SystemKeyboardOn = 6,
        SystemKeyboardOff = 7,
    }
}

impl SuperFoldStatusChangeEvent {
    pub const ALL: [Self; 7] = [
        Self::AngleChangeExpanded,
        Self::AngleChangeHalfFolded,
        Self::AngleChangeFolded,
        Self::KeyboardOn,
        Self::KeyboardOff,
        Self::SystemKeyboardOn,
        Self::SystemKeyboardOff,
    ];
}

/// Effect bound to a fold transition, named after the move it makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FoldAction {
    /// First posture reading after boot.
    Initialize,
    ExpandedToHalfFolded,
    HalfFoldedToExpanded,
    HalfFoldedToKeyboard,
    KeyboardToHalfFolded,
    HalfFoldedToFolded,
    FoldedToHalfFolded,
    HalfFoldedToSoftKeyboard,
    SoftKeyboardToHalfFolded,
    SoftKeyboardToExpanded,
}

/// Receives fold transitions. Called with the manager's lock held, so it
/// must not feed events back into the manager.
pub trait FoldTransitionHandler: Send + Sync {
    fn on_fold_transition(&self, action: FoldAction, from: SuperFoldStatus, to: SuperFoldStatus);
}

type Key = (SuperFoldStatus, SuperFoldStatusChangeEvent);

fn build_table() -> HashMap<Key, (SuperFoldStatus, FoldAction)> {
    use FoldAction as A;
    use SuperFoldStatus as S;
    use SuperFoldStatusChangeEvent as E;

    HashMap::from([
        ((S::Unknown, E::AngleChangeExpanded), (S::Expanded, A::Initialize)),
        ((S::Unknown, E::AngleChangeHalfFolded), (S::HalfFolded, A::Initialize)),
        ((S::Unknown, E::AngleChangeFolded), (S::Folded, A::Initialize)),
        ((S::Expanded, E::AngleChangeHalfFolded), (S::HalfFolded, A::ExpandedToHalfFolded)),
        ((S::HalfFolded, E::AngleChangeExpanded), (S::Expanded, A::HalfFoldedToExpanded)),
        ((S::HalfFolded, E::KeyboardOn), (S::Keyboard, A::HalfFoldedToKeyboard)),
        ((S::Keyboard, E::KeyboardOff), (S::HalfFolded, A::KeyboardToHalfFolded)),
        ((S::HalfFolded, E::AngleChangeFolded), (S::Folded, A::HalfFoldedToFolded)),
        ((S::Folded, E::AngleChangeHalfFolded), (S::HalfFolded, A::FoldedToHalfFolded)),
        ((S::HalfFolded, E::SystemKeyboardOn), (S::SoftKeyboard, A::HalfFoldedToSoftKeyboard)),
        ((S::SoftKeyboard, E::SystemKeyboardOff), (S::HalfFolded, A::SoftKeyboardToHalfFolded)),
        ((S::SoftKeyboard, E::AngleChangeExpanded), (S::Expanded, A::SoftKeyboardToExpanded)),
    ])
}

pub struct SuperFoldStateManager {
    status: Mutex<SuperFoldStatus>,
    table: HashMap<Key, (SuperFoldStatus, FoldAction)>,
    handler: Arc<dyn FoldTransitionHandler>,
}

impl SuperFoldStateManager {
    pub fn new(handler: Arc<dyn FoldTransitionHandler>) -> Self {
        Self {
            status: Mutex::new(SuperFoldStatus::Unknown),
            table: build_table(),
            handler,
        }
    }

    /// Apply a sensor event and return the resulting status.
    pub fn handle_super_fold_status_change(&self, event: SuperFoldStatusChangeEvent) -> SuperFoldStatus {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *status;
        let Some(&(to, action)) = self.table.get(&(from, event)) else {
            debug!("[Fold] {event:?} ignored in {from:?}");
            return from;
        };
        self.handler.on_fold_transition(action, from, to);
        info!("[Fold] {from:?} -> {to:?} on {event:?}");
        *status = to;
        to
    }

    pub fn current_status(&self) -> SuperFoldStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite the status without running any action.
    pub fn set_current_status(&self, status: SuperFoldStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<FoldAction>>);

    impl FoldTransitionHandler for Recorder {
        fn on_fold_transition(&self, action: FoldAction, _from: SuperFoldStatus, _to: SuperFoldStatus) {
            self.0.lock().unwrap().push(action);
        }
    }

    fn manager() -> (SuperFoldStateManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (SuperFoldStateManager::new(recorder.clone()), recorder)
    }

    #[test]
    fn test_half_folded_to_expanded_then_keyboard_ignored() {
        let (fold, recorder) = manager();
        fold.set_current_status(SuperFoldStatus::HalfFolded);

        let status = fold.handle_super_fold_status_change(SuperFoldStatusChangeEvent::AngleChangeExpanded);
        assert_eq!(status, SuperFoldStatus::Expanded);
        assert_eq!(*recorder.0.lock().unwrap(), vec![FoldAction::HalfFoldedToExpanded]);

        let status = fold.handle_super_fold_status_change(SuperFoldStatusChangeEvent::KeyboardOn);
        assert_eq!(status, SuperFoldStatus::Expanded);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_first_reading_leaves_unknown() {
        let (fold, _) = manager();
        assert_eq!(fold.current_status(), SuperFoldStatus::Unknown);
        fold.handle_super_fold_status_change(SuperFoldStatusChangeEvent::AngleChangeFolded);
        assert_eq!(fold.current_status(), SuperFoldStatus::Folded);
    }

    #[test]
    fn test_keyboard_round_trip() {
        let (fold, recorder) = manager();
        fold.set_current_status(SuperFoldStatus::HalfFolded);
        fold.handle_super_fold_status_change(SuperFoldStatusChangeEvent::SystemKeyboardOn);
        fold.handle_super_fold_status_change(SuperFoldStatusChangeEvent::SystemKeyboardOff);
        fold.handle_super_fold_status_change(SuperFoldStatusChangeEvent::KeyboardOn);
        assert_eq!(fold.current_status(), SuperFoldStatus::Keyboard);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                FoldAction::HalfFoldedToSoftKeyboard,
                FoldAction::SoftKeyboardToHalfFolded,
                FoldAction::HalfFoldedToKeyboard,
            ]
        );
    }

    #[test]
    fn test_unmapped_events_never_change_status() {
        let table = build_table();
        for status in [
            SuperFoldStatus::Folded,
            SuperFoldStatus::HalfFolded,
            SuperFoldStatus::Expanded,
            SuperFoldStatus::Keyboard,
            SuperFoldStatus::SoftKeyboard,
        ] {
            for event in SuperFoldStatusChangeEvent::ALL {
                if table.contains_key(&(status, event)) {
                    continue;
                }
                let (fold, recorder) = manager();
                fold.set_current_status(status);
                assert_eq!(fold.handle_super_fold_status_change(event), status);
                assert!(recorder.0.lock().unwrap().is_empty());
            }
        }
    }
}
