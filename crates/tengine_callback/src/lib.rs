mod bridge;

pub use bridge::{
    BridgeError, CallbackBridge, CallbackInvocation, CallbackReceipt, RecordingCallbackBridge,
};
