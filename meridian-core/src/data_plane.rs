//! Boundary to the data plane that actually forwards traffic.

use std::fmt;

use crate::model::Role;

/// Commands the coordination plane issues to the data plane.
///
/// Every call is fire-and-forget: implementations must not block the caller
/// on data-plane confirmation and report failures through their own logs.
pub trait DataPlaneController: Send + Sync + 'static {
    fn create_local_session(&self, region: &str, topic_name: &str, type_name: &str, role: Role);
    fn delete_local_session(&self, region: &str, topic_name: &str, type_name: &str, role: Role);
    fn create_cross_region_session(&self, broker: &str, topic_name: &str, type_name: &str);
    fn delete_cross_region_session(&self, broker: &str, topic_name: &str, type_name: &str);
    fn add_peer(&self, scope: &str, locator: &str, primary: bool);
    fn remove_peer(&self, scope: &str, locator: &str, primary: bool);
}

/// A data-plane call captured as a value, for queuing and inspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataPlaneCommand {
    CreateLocalSession {
        region: String,
        topic_name: String,
        type_name: String,
        role: Role,
    },
    DeleteLocalSession {
        region: String,
        topic_name: String,
        type_name: String,
        role: Role,
    },
    CreateCrossRegionSession {
        broker: String,
        topic_name: String,
        type_name: String,
    },
    DeleteCrossRegionSession {
        broker: String,
        topic_name: String,
        type_name: String,
    },
    AddPeer {
        scope: String,
        locator: String,
        primary: bool,
    },
    RemovePeer {
        scope: String,
        locator: String,
        primary: bool,
    },
}

impl DataPlaneCommand {
    /// Replay this command against a controller.
    pub fn apply(&self, controller: &dyn DataPlaneController) {
        match self {
            DataPlaneCommand::CreateLocalSession {
                region,
                topic_name,
                type_name,
                role,
            } => controller.create_local_session(region, topic_name, type_name, *role),
            DataPlaneCommand::DeleteLocalSession {
                region,
                topic_name,
                type_name,
                role,
            } => controller.delete_local_session(region, topic_name, type_name, *role),
            DataPlaneCommand::CreateCrossRegionSession {
                broker,
                topic_name,
                type_name,
            } => controller.create_cross_region_session(broker, topic_name, type_name),
            DataPlaneCommand::DeleteCrossRegionSession {
                broker,
                topic_name,
                type_name,
            } => controller.delete_cross_region_session(broker, topic_name, type_name),
            DataPlaneCommand::AddPeer {
                scope,
                locator,
                primary,
            } => controller.add_peer(scope, locator, *primary),
            DataPlaneCommand::RemovePeer {
                scope,
                locator,
                primary,
            } => controller.remove_peer(scope, locator, *primary),
        }
    }
}

impl fmt::Display for DataPlaneCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPlaneCommand::CreateLocalSession {
                region,
                topic_name,
                type_name,
                role,
            } => write!(
                f,
                "CreateLocalSession(region: {}, topic: {}, type: {}, role: {})",
                region, topic_name, type_name, role
            ),
            DataPlaneCommand::DeleteLocalSession {
                region,
                topic_name,
                type_name,
                role,
            } => write!(
                f,
                "DeleteLocalSession(region: {}, topic: {}, type: {}, role: {})",
                region, topic_name, type_name, role
            ),
            DataPlaneCommand::CreateCrossRegionSession {
                broker,
                topic_name,
                type_name,
            } => write!(
                f,
                "CreateCrossRegionSession(broker: {}, topic: {}, type: {})",
                broker, topic_name, type_name
            ),
            DataPlaneCommand::DeleteCrossRegionSession {
                broker,
                topic_name,
                type_name,
            } => write!(
                f,
                "DeleteCrossRegionSession(broker: {}, topic: {}, type: {})",
                broker, topic_name, type_name
            ),
            DataPlaneCommand::AddPeer {
                scope,
                locator,
                primary,
            } => write!(
                f,
                "AddPeer(scope: {}, locator: {}, primary: {})",
                scope, locator, primary
            ),
            DataPlaneCommand::RemovePeer {
                scope,
                locator,
                primary,
            } => write!(
                f,
                "RemovePeer(scope: {}, locator: {}, primary: {})",
                scope, locator, primary
            ),
        }
    }
}
