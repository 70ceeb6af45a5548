/// Value returned by every application callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReturn {
    /// Event fully handled
    Success,
    /// Not fully handled; the reactor also hands the message to the
    /// default message callback
    Raise,
    /// Fatal; the reactor shuts down
    Failure,
}

impl CallbackReturn {
    pub fn is_failure(self) -> bool {
        self == CallbackReturn::Failure
    }
}
