// Exit codes for triage of a failed run
use mmult_host::Stage;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAIL: i32 = 1;
/// Reserved for argument errors; clap exits with it on its own.
#[allow(dead_code)]
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_SETUP_FAIL: i32 = 3;
pub const EXIT_DEVICE_FAIL: i32 = 4;
pub const EXIT_VERIFY_FAIL: i32 = 5;

pub fn for_stage(stage: Stage) -> i32 {
    match stage {
        Stage::Configure => EXIT_GENERIC_FAIL,
        Stage::Resolve | Stage::Load | Stage::Context => EXIT_SETUP_FAIL,
        Stage::Buffers | Stage::Dispatch => EXIT_DEVICE_FAIL,
        Stage::Verify => EXIT_VERIFY_FAIL,
    }
}
