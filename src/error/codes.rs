/// Error code registry for the swarm engine
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Work store errors
/// - 3000-3999: Lease pool errors
/// - 4000-4999: Execution errors
/// - 5000-5999: Workflow errors
/// - 6000-6999: Verification errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;
    pub const CONFIG_PID_LOCKED: u16 = 1004;

    // Work store errors (2000-2999)
    pub const STORE_GENERIC: u16 = 2000;
    pub const STORE_CONNECTION: u16 = 2001;
    pub const STORE_QUERY: u16 = 2002;
    pub const STORE_NOT_FOUND: u16 = 2003;
    pub const STORE_SERIALIZATION: u16 = 2004;

    // Lease pool errors (3000-3999)
    pub const LEASE_GENERIC: u16 = 3000;
    pub const LEASE_POOL_EXHAUSTED: u16 = 3001;
    pub const LEASE_LOCK_IO: u16 = 3002;
    pub const LEASE_SPAWN_FAILED: u16 = 3003;
    pub const LEASE_UNHEALTHY: u16 = 3004;
    pub const LEASE_DRIVER: u16 = 3005;

    // Execution errors (4000-4999)
    pub const EXEC_GENERIC: u16 = 4000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 4001;
    pub const EXEC_TIMEOUT: u16 = 4002;
    pub const EXEC_SUBPROCESS_FAILED: u16 = 4003;
    pub const EXEC_SIGNAL_RECEIVED: u16 = 4005;
    pub const EXEC_SPAWN_FAILED: u16 = 4007;
    pub const EXEC_OUTPUT_ERROR: u16 = 4008;
    pub const EXEC_AGENT_NOT_FOUND: u16 = 4011;
    pub const EXEC_TRANSFER_FAILED: u16 = 4012;
    pub const EXEC_STAGING_FAILED: u16 = 4013;

    // Workflow errors (5000-5999)
    pub const WORKFLOW_GENERIC: u16 = 5000;
    pub const WORKFLOW_INVALID_STEP: u16 = 5002;
    pub const WORKFLOW_STEP_FAILED: u16 = 5003;
    pub const WORKFLOW_CANCELLED: u16 = 5006;
    pub const WORKFLOW_CIRCULAR_DEPENDENCY: u16 = 5010;
    pub const WORKFLOW_INTERPOLATION_ERROR: u16 = 5012;
    pub const WORKFLOW_UNKNOWN_DEPENDENCY: u16 = 5013;
    pub const WORKFLOW_DUPLICATE_STEP: u16 = 5014;

    // Verification errors (6000-6999)
    pub const VERIFY_GENERIC: u16 = 6000;
    pub const VERIFY_JUDGE_UNAVAILABLE: u16 = 6001;
    pub const VERIFY_JUDGE_TIMEOUT: u16 = 6002;
    pub const VERIFY_INVALID_RESPONSE: u16 = 6003;
    pub const VERIFY_MERGE_FAILED: u16 = 6004;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL_ERROR: u16 = 9004;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Failed to parse configuration",
        1003 => "Invalid value in configuration",
        1004 => "Another engine process holds the pid file",

        2000 => "Generic work store error",
        2001 => "Work store connection failed",
        2002 => "Work store query failed",
        2003 => "Ticket not found",
        2004 => "Work store serialization error",

        3000 => "Generic lease pool error",
        3001 => "No execution slot could be acquired",
        3002 => "Slot lock file I/O failed",
        3003 => "Execution environment failed to spawn",
        3004 => "Execution environment is unhealthy",
        3005 => "Execution environment tooling failed",

        4000 => "Generic execution error",
        4001 => "Command not found",
        4002 => "Command execution timeout",
        4003 => "Subprocess failed",
        4005 => "Command received signal",
        4007 => "Failed to spawn subprocess",
        4008 => "Command output error",
        4011 => "Agent definition not found",
        4012 => "Payload transfer to or from the environment failed",
        4013 => "Failed to prepare staging directory",

        5000 => "Generic workflow error",
        5002 => "Malformed workflow step",
        5003 => "Workflow step failed",
        5006 => "Workflow cancelled",
        5010 => "Circular dependency in workflow",
        5012 => "Variable interpolation error",
        5013 => "Step depends on an unknown step",
        5014 => "Duplicate step id in workflow",

        6000 => "Generic verification error",
        6001 => "Verification judge unavailable",
        6002 => "Verification judge timed out",
        6003 => "Verification judge returned an invalid response",
        6004 => "Pull request merge failed",

        9000 => "Generic error",
        9004 => "Internal error",

        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_registered_code_has_description() {
        for code in [
            ErrorCode::CONFIG_PID_LOCKED,
            ErrorCode::STORE_NOT_FOUND,
            ErrorCode::LEASE_POOL_EXHAUSTED,
            ErrorCode::EXEC_AGENT_NOT_FOUND,
            ErrorCode::WORKFLOW_CIRCULAR_DEPENDENCY,
            ErrorCode::VERIFY_MERGE_FAILED,
        ] {
            assert_ne!(describe_error_code(code), "Unknown error code");
        }
        assert_eq!(describe_error_code(42), "Unknown error code");
    }
}
