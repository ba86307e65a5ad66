//! Session outcome flags.
//!
//! [`SessionState`] is the bookkeeping the feature drivers keep about what
//! has succeeded so far: WiFi association, the cloud TCP session, the last
//! telemetry upload, and SNTP time sync. The protocol engine never reads or
//! writes it.
//!
//! Each flag is cleared when the corresponding operation starts and set only
//! when it fully succeeds. Nothing ties the flags together: `cloud_session_up`
//! can still read `true` after `link_up` has dropped, so callers check the
//! link before trusting derived state.

/// Names for the individual flags in [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFlag {
    /// Associated with a WiFi access point.
    LinkUp,
    /// TCP session to the cloud endpoint open.
    CloudSessionUp,
    /// The most recent upload was acknowledged.
    LastUploadOk,
    /// SNTP configured on the co-processor.
    TimeSyncInitialized,
    /// A valid network time has been read back.
    TimeSyncUpdated,
}

impl SessionFlag {
    /// All flags, in declaration order.
    pub const ALL: [SessionFlag; 5] = [
        SessionFlag::LinkUp,
        SessionFlag::CloudSessionUp,
        SessionFlag::LastUploadOk,
        SessionFlag::TimeSyncInitialized,
        SessionFlag::TimeSyncUpdated,
    ];
}

/// Named boolean flags recording the outcome of driver operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub link_up: bool,
    pub cloud_session_up: bool,
    pub last_upload_ok: bool,
    pub time_sync_initialized: bool,
    pub time_sync_updated: bool,
}

impl SessionState {
    /// Create a state with every flag cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a flag by name.
    pub fn get(&self, flag: SessionFlag) -> bool {
        match flag {
            SessionFlag::LinkUp => self.link_up,
            SessionFlag::CloudSessionUp => self.cloud_session_up,
            SessionFlag::LastUploadOk => self.last_upload_ok,
            SessionFlag::TimeSyncInitialized => self.time_sync_initialized,
            SessionFlag::TimeSyncUpdated => self.time_sync_updated,
        }
    }

    /// Set a flag by name.
    pub fn set(&mut self, flag: SessionFlag, value: bool) {
        let slot = match flag {
            SessionFlag::LinkUp => &mut self.link_up,
            SessionFlag::CloudSessionUp => &mut self.cloud_session_up,
            SessionFlag::LastUploadOk => &mut self.last_upload_ok,
            SessionFlag::TimeSyncInitialized => &mut self.time_sync_initialized,
            SessionFlag::TimeSyncUpdated => &mut self.time_sync_updated,
        };
        *slot = value;
    }
}
