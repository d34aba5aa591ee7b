use std::fmt;

/// Condition attached to every runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpreterCondition {
    InvalidOperandAddressV1,
    InvalidOperandFlagsAddressV1,
    InvalidOperandFlagsAddressV2,
    InvalidOperandJumpV1,
    InvalidOperandOffsetV1,
    InvalidOperandFlagsAddressPlacementV1,
    InvalidOperandTypeV1,
    InvalidDataStackV1,
    InvalidDataStackV2,
    InvalidDataStackValue,
    InvalidReceiver,
    RuntimeInvariant,
    MissingAssembly,
    MissingSymbol,
    ExceededMaximumRecursion,
    Interrupted,
    Aborted,
}

/// Coarse classification of a condition, for hosts that only care about
/// the broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Aborted,
    Internal,
    FailedPrecondition,
    Cancelled,
    Unknown,
}

impl InterpreterCondition {
    pub fn status_code(self) -> StatusCode {
        use InterpreterCondition::*;
        match self {
            InvalidOperandAddressV1
            | InvalidOperandFlagsAddressV1
            | InvalidOperandFlagsAddressV2
            | InvalidOperandJumpV1
            | InvalidOperandOffsetV1
            | InvalidOperandFlagsAddressPlacementV1
            | InvalidOperandTypeV1
            | InvalidDataStackV1
            | InvalidDataStackV2
            | InvalidDataStackValue
            | InvalidReceiver
            | Aborted => StatusCode::Aborted,
            RuntimeInvariant => StatusCode::Internal,
            MissingAssembly | MissingSymbol => StatusCode::FailedPrecondition,
            Interrupted => StatusCode::Cancelled,
            ExceededMaximumRecursion => StatusCode::Unknown,
        }
    }

    pub fn description(self) -> &'static str {
        use InterpreterCondition::*;
        match self {
            InvalidOperandAddressV1 => "Invalid operand (address)",
            InvalidOperandFlagsAddressV1 => "Invalid operand (flags)",
            InvalidOperandFlagsAddressV2 => "Invalid operand (flags address)",
            InvalidOperandJumpV1 => "Invalid operand (jump)",
            InvalidOperandOffsetV1 => "Invalid operand (offset)",
            InvalidOperandFlagsAddressPlacementV1 => "Invalid operand (placement)",
            InvalidOperandTypeV1 => "Invalid operand (type)",
            InvalidDataStackV1 => "Invalid data stack (first operand)",
            InvalidDataStackV2 => "Invalid data stack (second operand)",
            InvalidDataStackValue => "Invalid data stack value",
            InvalidReceiver => "Invalid receiver",
            RuntimeInvariant => "Runtime invariant",
            MissingAssembly => "Missing assembly",
            MissingSymbol => "Missing symbol",
            ExceededMaximumRecursion => "Exceeded maximum recursion",
            Interrupted => "Interrupted",
            Aborted => "Aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterStatus {
    pub condition: InterpreterCondition,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, InterpreterStatus>;

impl InterpreterStatus {
    pub fn for_condition(condition: InterpreterCondition, message: impl Into<String>) -> Self {
        Self {
            condition,
            message: message.into(),
        }
    }

    /// Shorthand for the structural failures that make up most of the
    /// runtime's error paths.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::for_condition(InterpreterCondition::RuntimeInvariant, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.condition.status_code()
    }

    pub fn is(&self, condition: InterpreterCondition) -> bool {
        self.condition == condition
    }
}

impl fmt::Display for InterpreterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.condition.description())
        } else {
            write!(f, "{}: {}", self.condition.description(), self.message)
        }
    }
}

impl std::error::Error for InterpreterStatus {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_map_to_status_codes() {
        assert_eq!(
            InterpreterCondition::InvalidReceiver.status_code(),
            StatusCode::Aborted
        );
        assert_eq!(
            InterpreterCondition::RuntimeInvariant.status_code(),
            StatusCode::Internal
        );
        assert_eq!(
            InterpreterCondition::MissingSymbol.status_code(),
            StatusCode::FailedPrecondition
        );
        assert_eq!(
            InterpreterCondition::Interrupted.status_code(),
            StatusCode::Cancelled
        );
    }

    #[test]
    fn display_includes_condition_and_message() {
        let status = InterpreterStatus::invariant("missing lexical");
        assert_eq!(status.to_string(), "Runtime invariant: missing lexical");
        let bare = InterpreterStatus::for_condition(InterpreterCondition::Interrupted, "");
        assert_eq!(bare.to_string(), "Interrupted");
    }
}
