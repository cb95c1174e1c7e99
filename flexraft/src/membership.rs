//! Cluster membership: servers, roles, groups and the replicated configuration.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DecodeError;
use crate::quorum;
use crate::MessageSummary;
use crate::NodeId;

/// The role a server plays in the cluster.
///
/// Only voters count towards quorum. A logger receives and persists entries but does not vote.
/// A standby receives entries and is the intermediate state used while catching a server up.
/// A spare is inert until promoted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServerRole {
    Standby = 0,
    Voter = 1,
    Spare = 2,
    Logger = 3,
}

impl ServerRole {
    pub(crate) fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(ServerRole::Standby),
            1 => Ok(ServerRole::Voter),
            2 => Ok(ServerRole::Spare),
            3 => Ok(ServerRole::Logger),
            _ => Err(DecodeError::Malformed("unknown server role code")),
        }
    }

    /// The literal used for this role in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ServerRole::Standby => "standby",
            ServerRole::Voter => "voter",
            ServerRole::Spare => "spare",
            ServerRole::Logger => "logger",
        }
    }
}

impl Display for ServerRole {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The joint-consensus group(s) a server belongs to, as a bitmask of OLD and NEW.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group(pub u8);

impl Group {
    pub const OLD: Group = Group(1);
    pub const NEW: Group = Group(2);
    pub const ANY: Group = Group(3);

    /// Check whether this membership mask includes the given group.
    pub fn contains(&self, other: Group) -> bool {
        self.0 & other.0 != 0
    }

    /// The union of this mask and the given group.
    pub fn with(self, other: Group) -> Group {
        Group(self.0 | other.0)
    }

    /// This mask with the given group removed.
    pub fn without(self, other: Group) -> Group {
        Group(self.0 & !other.0)
    }
}

/// A single server of the cluster configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The server's unique, non-zero ID.
    pub id: NodeId,
    /// The server's role in the OLD group.
    pub role: ServerRole,
    /// The server's role in the NEW group once a joint transition completes.
    ///
    /// Equal to `role` outside of a joint transition.
    pub role_new: ServerRole,
    /// The joint-consensus group(s) the server belongs to.
    pub group: Group,
}

impl Server {
    fn new(id: NodeId, role: ServerRole) -> Self {
        Server {
            id,
            role,
            role_new: role,
            group: Group::OLD,
        }
    }
}

/// The phase of the replicated configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationPhase {
    /// A single voter group is active.
    Normal,
    /// Both the OLD and the NEW group are active and quorum requires majorities in both.
    Joint,
}

/// The replicated cluster configuration.
///
/// Servers are kept ordered by ID. In the `Joint` phase, group membership and `role_new`
/// describe the transition; quorum is computed per group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
    pub phase: ConfigurationPhase,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Configuration {
            servers: Vec::new(),
            phase: ConfigurationPhase::Normal,
        }
    }

    /// Create an initial single-group configuration from a set of voter IDs.
    pub fn with_voters(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut conf = Configuration::new();
        for id in ids {
            conf.add(id, ServerRole::Voter).expect("voter ids must be unique and non-zero");
        }
        conf
    }

    /// Add a server to the configuration, keeping the list ordered by ID.
    pub fn add(&mut self, id: NodeId, role: ServerRole) -> Result<(), AddError> {
        if id == 0 {
            return Err(AddError::BadId);
        }
        match self.servers.binary_search_by_key(&id, |s| s.id) {
            Ok(_) => Err(AddError::DuplicateId),
            Err(pos) => {
                self.servers.insert(pos, Server::new(id, role));
                Ok(())
            }
        }
    }

    /// Remove the server with the given ID.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.servers.binary_search_by_key(&id, |s| s.id) {
            Ok(pos) => {
                self.servers.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// The index of the server with the given ID, if present.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.servers.binary_search_by_key(&id, |s| s.id).ok()
    }

    /// The position of the given ID among the voting servers, if it is one.
    pub fn index_of_voter(&self, id: NodeId) -> Option<usize> {
        self.servers
            .iter()
            .filter(|s| self.is_voter(s, Group::ANY))
            .position(|s| s.id == id)
    }

    /// Get the server with the given ID.
    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.index_of(id).map(|i| &self.servers[i])
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Server> {
        match self.servers.binary_search_by_key(&id, |s| s.id) {
            Ok(pos) => Some(&mut self.servers[pos]),
            Err(_) => None,
        }
    }

    /// Check whether a server with the given ID is part of the configuration.
    pub fn contains(&self, id: NodeId) -> bool {
        self.index_of(id).is_some()
    }

    /// The role of the server with the given ID, if present.
    pub fn server_role(&self, id: NodeId) -> Option<ServerRole> {
        self.get(id).map(|s| s.role)
    }

    /// Check whether the given server votes in the given group.
    ///
    /// Outside of a joint transition only the current role matters. During a joint
    /// transition the OLD group is governed by `role` and the NEW group by `role_new`.
    pub fn is_voter(&self, server: &Server, group: Group) -> bool {
        match self.phase {
            ConfigurationPhase::Normal => server.role == ServerRole::Voter,
            ConfigurationPhase::Joint => {
                let old = group.contains(Group::OLD)
                    && server.group.contains(Group::OLD)
                    && server.role == ServerRole::Voter;
                let new = group.contains(Group::NEW)
                    && server.group.contains(Group::NEW)
                    && server.role_new == ServerRole::Voter;
                old || new
            }
        }
    }

    /// Check whether the given server is an inert spare in every group it belongs to.
    pub fn is_spare(&self, server: &Server) -> bool {
        match self.phase {
            ConfigurationPhase::Normal => server.role == ServerRole::Spare,
            ConfigurationPhase::Joint => {
                let old_spare = !server.group.contains(Group::OLD) || server.role == ServerRole::Spare;
                let new_spare = !server.group.contains(Group::NEW) || server.role_new == ServerRole::Spare;
                old_spare && new_spare
            }
        }
    }

    /// The number of voting servers in the given group.
    pub fn voter_count(&self, group: Group) -> usize {
        self.servers.iter().filter(|s| self.is_voter(s, group)).count()
    }

    /// The quorum size of the given group.
    pub fn quorum(&self, group: Group) -> usize {
        quorum::majority_of(self.voter_count(group))
    }

    /// The groups that are active for quorum purposes.
    pub fn active_groups(&self) -> &'static [Group] {
        match self.phase {
            ConfigurationPhase::Normal => &[Group::OLD],
            ConfigurationPhase::Joint => &[Group::OLD, Group::NEW],
        }
    }

    /// Begin a joint transition which removes the given server from the NEW group.
    ///
    /// Every other server becomes a member of both groups; the removed server stays in
    /// OLD only, so that it keeps its duties until the transition commits.
    pub fn joint_remove(&mut self, id: NodeId) {
        self.phase = ConfigurationPhase::Joint;
        for server in self.servers.iter_mut() {
            server.role_new = server.role;
            server.group = if server.id == id { Group::OLD } else { Group::ANY };
        }
    }

    /// Abandon an uncommitted joint transition, restoring the NORMAL phase.
    pub fn joint_reset(&mut self) {
        self.phase = ConfigurationPhase::Normal;
        for server in self.servers.iter_mut() {
            server.role_new = server.role;
            server.group = Group::OLD;
        }
    }

    /// Collapse a joint configuration into a NORMAL one consisting of the target group.
    ///
    /// Servers not in the target group are dropped; the surviving servers take the role
    /// they have in that group.
    pub fn joint_to_normal(&self, target: Group) -> Configuration {
        let mut conf = Configuration::new();
        for server in self.servers.iter() {
            if !server.group.contains(target) {
                continue;
            }
            let role = if target.contains(Group::NEW) { server.role_new } else { server.role };
            conf.add(server.id, role).expect("joint configuration has unique ids");
        }
        conf
    }

    /// Assign the NEW-group role of the server with the given ID during a joint transition.
    pub fn set_role_new(&mut self, id: NodeId, role: ServerRole) {
        if let Some(server) = self.get_mut(id) {
            server.role_new = role;
        }
    }

    /// Assign the role of the server with the given ID.
    pub fn set_role(&mut self, id: NodeId, role: ServerRole) {
        let is_normal = self.phase == ConfigurationPhase::Normal;
        if let Some(server) = self.get_mut(id) {
            server.role = role;
            if is_normal {
                server.role_new = role;
            }
        }
    }
}

impl MessageSummary for Configuration {
    fn summary(&self) -> String {
        let servers = self
            .servers
            .iter()
            .map(|s| format!("{}:{}/{}:{:?}", s.id, s.role, s.role_new, s.group.0))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{phase={:?} [{}]}}", self.phase, servers)
    }
}

/// Errors surfaced by `Configuration::add`.
#[derive(Debug, PartialEq, Eq)]
pub enum AddError {
    /// Server IDs must be non-zero.
    BadId,
    /// A server with the given ID is already present.
    DuplicateId,
}

// Wire format. The layout is versioned and kept stable because configurations are
// persisted inside CHANGE entries and snapshots:
//
//   u8  version (1)
//   u64 n
//   { u64 id; u8 role } * n          -- legacy tail, readable by old decoders
//   u8[256] meta block:
//       u32 meta_version (1), u32 server_version (1), u32 server_size (11),
//       u8 phase, reserved...
//   { u64 id; u8 role; u8 role_new; u8 group } * n
//   zero padding to an 8-byte boundary
//
// Decoders accept payloads that end after the legacy tail (phase=Normal,
// role_new=role, group=OLD).

const ENCODING_FORMAT_VERSION: u8 = 1;
const META_VERSION: u32 = 1;
const SERVER_VERSION: u32 = 1;
const SERVER_SIZE: u32 = 11;
const META_SIZE: usize = 256;

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        if self.remaining() < 1 {
            return Err(DecodeError::Malformed("payload too short"));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        if self.remaining() < 4 {
            return Err(DecodeError::Malformed("payload too short"));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        if self.remaining() < 8 {
            return Err(DecodeError::Malformed("payload too short"));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes))
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Malformed("payload too short"));
        }
        self.pos += n;
        Ok(())
    }
}

impl Configuration {
    /// Encode this configuration into its stable wire format.
    pub fn encode(&self) -> Vec<u8> {
        let n = self.servers.len();
        let mut buf = Vec::with_capacity(1 + 8 + n * 9 + META_SIZE + n * SERVER_SIZE as usize + 8);

        buf.push(ENCODING_FORMAT_VERSION);
        put_u64(&mut buf, n as u64);

        // Legacy tail.
        for server in self.servers.iter() {
            put_u64(&mut buf, server.id);
            buf.push(server.role as u8);
        }

        // Meta block.
        let meta_start = buf.len();
        put_u32(&mut buf, META_VERSION);
        put_u32(&mut buf, SERVER_VERSION);
        put_u32(&mut buf, SERVER_SIZE);
        buf.push(match self.phase {
            ConfigurationPhase::Normal => 0,
            ConfigurationPhase::Joint => 1,
        });
        buf.resize(meta_start + META_SIZE, 0);

        // Long-form server records.
        for server in self.servers.iter() {
            put_u64(&mut buf, server.id);
            buf.push(server.role as u8);
            buf.push(server.role_new as u8);
            buf.push(server.group.0);
        }

        // Pad to an 8-byte boundary.
        let padded = (buf.len() + 7) & !7;
        buf.resize(padded, 0);

        buf
    }

    /// Decode a configuration from its wire format, accepting both the legacy short
    /// form and the long form with the meta block.
    pub fn decode(buf: &[u8]) -> Result<Configuration, DecodeError> {
        let mut cursor = Cursor::new(buf);

        let version = cursor.get_u8()?;
        if version != ENCODING_FORMAT_VERSION {
            return Err(DecodeError::Malformed("unknown encoding version"));
        }

        let n = cursor.get_u64()? as usize;

        let mut conf = Configuration::new();
        for _ in 0..n {
            let id = cursor.get_u64()?;
            let role = ServerRole::from_code(cursor.get_u8()?)?;
            conf.add(id, role).map_err(|_| DecodeError::Malformed("duplicate or zero server id"))?;
        }

        // Legacy payloads end right after the short records.
        if cursor.remaining() == 0 {
            return Ok(conf);
        }

        if cursor.remaining() < META_SIZE {
            return Err(DecodeError::Malformed("truncated meta block"));
        }
        let meta_version = cursor.get_u32()?;
        if meta_version != META_VERSION {
            return Err(DecodeError::Malformed("unknown meta version"));
        }
        let server_version = cursor.get_u32()?;
        if server_version != SERVER_VERSION {
            return Err(DecodeError::Malformed("unknown server record version"));
        }
        let server_size = cursor.get_u32()?;
        if server_size < SERVER_SIZE {
            return Err(DecodeError::Malformed("server record too small"));
        }
        let phase = match cursor.get_u8()? {
            0 => ConfigurationPhase::Normal,
            1 => ConfigurationPhase::Joint,
            _ => return Err(DecodeError::Malformed("unknown configuration phase")),
        };
        cursor.skip(META_SIZE - 13)?;

        conf.phase = phase;
        for _ in 0..n {
            let id = cursor.get_u64()?;
            let role = ServerRole::from_code(cursor.get_u8()?)?;
            let role_new = ServerRole::from_code(cursor.get_u8()?)?;
            let group = Group(cursor.get_u8()?);
            cursor.skip(server_size as usize - SERVER_SIZE as usize)?;
            let server = conf.get_mut(id).ok_or(DecodeError::Malformed("unknown server in long form"))?;
            server.role = role;
            server.role_new = role_new;
            server.group = group;
        }

        // The trailing padding is ignored.
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use super::*;

    fn conf(servers: &[(NodeId, ServerRole)]) -> Configuration {
        let mut c = Configuration::new();
        for (id, role) in servers {
            c.add(*id, *role).unwrap();
        }
        c
    }

    #[test]
    fn test_voter_count_all_voters() {
        let c = conf(&[(1, ServerRole::Voter), (2, ServerRole::Voter)]);
        assert_eq!(c.voter_count(Group::ANY), 2);
    }

    #[test]
    fn test_voter_count_ignores_non_voters() {
        let c = conf(&[
            (1, ServerRole::Voter),
            (2, ServerRole::Standby),
            (3, ServerRole::Spare),
            (4, ServerRole::Logger),
        ]);
        assert_eq!(c.voter_count(Group::ANY), 1);
    }

    #[test]
    fn test_add_keeps_servers_ordered_by_id() {
        let c = conf(&[(5, ServerRole::Voter), (3, ServerRole::Spare), (9, ServerRole::Standby)]);
        let ids: Vec<_> = c.servers.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn test_add_rejects_zero_and_duplicate_ids() {
        let mut c = conf(&[(1, ServerRole::Voter)]);
        assert_eq!(c.add(0, ServerRole::Voter), Err(AddError::BadId));
        assert_eq!(c.add(1, ServerRole::Spare), Err(AddError::DuplicateId));
    }

    #[test]
    fn test_index_of_voter() {
        let c = conf(&[(1, ServerRole::Standby), (2, ServerRole::Voter), (3, ServerRole::Voter)]);
        assert_eq!(c.index_of_voter(2), Some(0));
        assert_eq!(c.index_of_voter(3), Some(1));
        assert_eq!(c.index_of_voter(1), None);
        assert_eq!(c.index_of_voter(7), None);
    }

    #[test]
    fn test_remove() {
        let mut c = conf(&[(1, ServerRole::Voter), (2, ServerRole::Voter)]);
        assert!(c.remove(1));
        assert!(!c.remove(1));
        assert_eq!(c.servers.len(), 1);
        assert_eq!(c.servers[0].id, 2);
    }

    #[test]
    fn test_joint_remove_splits_groups() {
        let mut c = conf(&[(1, ServerRole::Voter), (2, ServerRole::Voter), (3, ServerRole::Voter)]);
        c.joint_remove(3);
        assert_eq!(c.phase, ConfigurationPhase::Joint);
        assert_eq!(c.get(3).unwrap().group, Group::OLD);
        assert_eq!(c.get(1).unwrap().group, Group::ANY);
        assert_eq!(c.voter_count(Group::OLD), 3);
        assert_eq!(c.voter_count(Group::NEW), 2);
    }

    #[test]
    fn test_joint_promote_counts_new_group_voter() {
        let mut c = conf(&[
            (1, ServerRole::Voter),
            (2, ServerRole::Voter),
            (3, ServerRole::Voter),
            (4, ServerRole::Spare),
        ]);
        c.joint_remove(3);
        c.set_role_new(4, ServerRole::Voter);
        // OLD: 1, 2, 3 vote. NEW: 1, 2, 4 vote.
        assert_eq!(c.voter_count(Group::OLD), 3);
        assert_eq!(c.voter_count(Group::NEW), 3);
        let four = c.get(4).unwrap();
        assert!(c.is_voter(four, Group::NEW));
        assert!(!c.is_voter(four, Group::OLD));
    }

    #[test]
    fn test_joint_to_normal_collapses_to_target_group() {
        let mut c = conf(&[
            (1, ServerRole::Voter),
            (2, ServerRole::Voter),
            (3, ServerRole::Voter),
            (4, ServerRole::Spare),
        ]);
        c.joint_remove(3);
        c.set_role_new(4, ServerRole::Voter);

        let collapsed = c.joint_to_normal(Group::NEW);
        assert_eq!(collapsed.phase, ConfigurationPhase::Normal);
        assert!(!collapsed.contains(3));
        assert_eq!(collapsed.server_role(4), Some(ServerRole::Voter));
        assert_eq!(collapsed.voter_count(Group::ANY), 3);
    }

    #[test]
    fn test_joint_reset_restores_normal_phase() {
        let mut c = conf(&[(1, ServerRole::Voter), (2, ServerRole::Voter)]);
        c.joint_remove(2);
        c.set_role_new(1, ServerRole::Logger);
        c.joint_reset();
        assert_eq!(c.phase, ConfigurationPhase::Normal);
        for s in c.servers.iter() {
            assert_eq!(s.role_new, s.role);
            assert_eq!(s.group, Group::OLD);
        }
    }

    #[test]
    fn test_encode_one_server_layout() {
        let c = conf(&[(1, ServerRole::Voter)]);
        let buf = c.encode();

        // Version byte + server count.
        let mut len = 1 + 8;
        len += 8 + 1; // legacy record
        len += META_SIZE;
        len += 8 + 1 + 1 + 1; // long-form record
        len = (len + 7) & !7;
        assert_eq!(buf.len(), len);

        assert_eq!(buf[0], 1);
        assert_eq!(u64::from_le_bytes(buf[1..9].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(buf[9..17].try_into().unwrap()), 1);
        assert_eq!(buf[17], ServerRole::Voter as u8);

        let meta = &buf[18..18 + META_SIZE];
        assert_eq!(u32::from_le_bytes(meta[0..4].try_into().unwrap()), META_VERSION);
        assert_eq!(u32::from_le_bytes(meta[4..8].try_into().unwrap()), SERVER_VERSION);
        assert_eq!(u32::from_le_bytes(meta[8..12].try_into().unwrap()), SERVER_SIZE);
        assert_eq!(meta[12], 0);

        let long = &buf[18 + META_SIZE..];
        assert_eq!(u64::from_le_bytes(long[0..8].try_into().unwrap()), 1);
        assert_eq!(long[8], ServerRole::Voter as u8);
        assert_eq!(long[9], ServerRole::Voter as u8);
        assert_eq!(long[10], Group::OLD.0);
    }

    #[test]
    fn test_decode_legacy_short_form() {
        #[rustfmt::skip]
        let bytes: Vec<u8> = vec![
            1,                      // version
            1, 0, 0, 0, 0, 0, 0, 0, // number of servers
            5, 0, 0, 0, 0, 0, 0, 0, // server id
            2,                      // role code (spare)
        ];
        let c = Configuration::decode(&bytes).unwrap();
        assert_eq!(c.phase, ConfigurationPhase::Normal);
        assert_eq!(c.servers.len(), 1);
        let s = c.get(5).unwrap();
        assert_eq!(s.role, ServerRole::Spare);
        assert_eq!(s.role_new, ServerRole::Spare);
        assert_eq!(s.group, Group::OLD);
    }

    #[test]
    fn test_decode_long_form_with_joint_phase() {
        #[rustfmt::skip]
        let mut bytes: Vec<u8> = vec![
            1,                      // version
            1, 0, 0, 0, 0, 0, 0, 0, // number of servers
            5, 0, 0, 0, 0, 0, 0, 0, // server id
            2,                      // role code (spare)
        ];
        let mut meta = vec![0u8; META_SIZE];
        meta[0..4].copy_from_slice(&META_VERSION.to_le_bytes());
        meta[4..8].copy_from_slice(&SERVER_VERSION.to_le_bytes());
        meta[8..12].copy_from_slice(&SERVER_SIZE.to_le_bytes());
        meta[12] = 1; // joint phase
        bytes.extend_from_slice(&meta);
        #[rustfmt::skip]
        bytes.extend_from_slice(&[
            5, 0, 0, 0, 0, 0, 0, 0, // server id
            2,                      // role (spare)
            1,                      // role_new (voter)
            3,                      // group (old | new)
        ]);

        let c = Configuration::decode(&bytes).unwrap();
        assert_eq!(c.phase, ConfigurationPhase::Joint);
        let s = c.get(5).unwrap();
        assert_eq!(s.role, ServerRole::Spare);
        assert_eq!(s.role_new, ServerRole::Voter);
        assert_eq!(s.group, Group::ANY);
    }

    #[test]
    fn test_decode_orders_servers_by_id() {
        #[rustfmt::skip]
        let bytes: Vec<u8> = vec![
            1,                      // version
            2, 0, 0, 0, 0, 0, 0, 0, // number of servers
            5, 0, 0, 0, 0, 0, 0, 0, // server id 5
            1,                      // voter
            3, 0, 0, 0, 0, 0, 0, 0, // server id 3
            2,                      // spare
        ];
        let c = Configuration::decode(&bytes).unwrap();
        assert_eq!(c.servers[0].id, 3);
        assert_eq!(c.servers[1].id, 5);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let bytes = vec![127u8];
        assert!(matches!(Configuration::decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let bytes = vec![1u8, 2, 0, 0, 0, 0, 0, 0, 0, 5];
        assert!(matches!(Configuration::decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut c = conf(&[
            (1, ServerRole::Voter),
            (2, ServerRole::Voter),
            (3, ServerRole::Logger),
            (4, ServerRole::Spare),
        ]);
        c.joint_remove(2);
        c.set_role_new(4, ServerRole::Voter);

        let decoded = Configuration::decode(&c.encode()).unwrap();
        assert_eq!(decoded, c);
    }
}
