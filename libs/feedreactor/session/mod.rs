//! Roles, callbacks and the session setup pipeline

pub mod role;
pub mod setup;

pub use role::{
    Callbacks, ChannelEventCallback, ConsumerSettings, DefaultMsgCallback, DictionaryDownloadMode,
    DictionaryMsgCallback, DirectoryMsgCallback, LoginMsgCallback, NiProviderSettings, Role,
    RoleKind,
};
pub use setup::SetupStage;
