// Phases of one update run, in the order they are entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Init,
    DeterminingPackages,
    CheckingCache,
    Downloading,
    ExtractingPackages,
    Done,
    Cancelled,
    Failed,
}

impl UpdateState {
    pub fn status(self) -> &'static str {
        match self {
            UpdateState::Init => "Initializing loader",
            UpdateState::DeterminingPackages => "Determining packages to load",
            UpdateState::CheckingCache => "Checking cache for existing files",
            UpdateState::Downloading => "Downloading packages",
            UpdateState::ExtractingPackages => "Extracting downloaded packages",
            UpdateState::Done => "Done loading",
            UpdateState::Cancelled => "Update cancelled",
            UpdateState::Failed => "Update failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Done | UpdateState::Cancelled | UpdateState::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            UpdateState::Init => 0,
            UpdateState::DeterminingPackages => 1,
            UpdateState::CheckingCache => 2,
            UpdateState::Downloading => 3,
            UpdateState::ExtractingPackages => 4,
            UpdateState::Done | UpdateState::Cancelled | UpdateState::Failed => 5,
        }
    }

    /// Forward only; `Cancelled`/`Failed` are reachable from any non-terminal state.
    pub fn can_transition_to(self, next: UpdateState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            UpdateState::Cancelled | UpdateState::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

// Messages sent to whoever drives the UI for this run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateEvent {
    State {
        state: UpdateState,
        status: &'static str,
    },
    Progress(u8),
    Error(String),
    Finished(UpdateOutcome),
}

/// Asks the user whether an existing installation should be replaced.
pub trait UpdatePrompt: Send + Sync {
    fn ask_update(&self, message: &str) -> bool;
}

impl<F> UpdatePrompt for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn ask_update(&self, message: &str) -> bool {
        self(message)
    }
}
