//! Local model of the server's channel tree and connected users.
//!
//! [`StateTree`] is an arena keyed by channel id and session id. It is only
//! mutated by applying server deltas; each `apply_*` call returns the
//! [`StateChange`] records it produced so the caller can raise events once
//! the tree is no longer locked. Inconsistent deltas are repaired locally
//! and logged instead of failing the connection.

use std::collections::{BTreeMap, BTreeSet};

use crate::proto::mumble::{ChannelRemove, ChannelState, PermissionQuery, UserRemove, UserState};

/// Id of the root channel, which always exists.
pub const ROOT_CHANNEL: u32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    /// `None` only for the root.
    pub parent: Option<u32>,
    pub children: BTreeSet<u32>,
    /// Symmetric: if `a` links `b`, `b` links `a`.
    pub links: BTreeSet<u32>,
    pub temporary: bool,
    pub position: i32,
    pub description: Option<String>,
    pub max_users: Option<u32>,
    /// Cached permission bits from the last `PermissionQuery` answer.
    pub permissions: Option<u32>,
}

impl Channel {
    fn new(id: u32, parent: Option<u32>) -> Self {
        Self {
            id,
            name: String::new(),
            parent,
            children: BTreeSet::new(),
            links: BTreeSet::new(),
            temporary: false,
            position: 0,
            description: None,
            max_users: None,
            permissions: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_CHANNEL
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct User {
    pub session: u32,
    /// Registered account id; `None` for anonymous users.
    pub user_id: Option<u32>,
    pub name: String,
    pub channel_id: u32,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub recording: bool,
    pub priority_speaker: bool,
    pub comment: Option<String>,
    /// Certificate hash.
    pub hash: Option<String>,
}

impl User {
    pub fn can_talk(&self) -> bool {
        !self.mute && !self.suppress && !self.self_mute
    }

    pub fn can_hear(&self) -> bool {
        !self.deaf && !self.self_deaf
    }

    pub fn flag(&self, flag: UserFlag) -> bool {
        match flag {
            UserFlag::Mute => self.mute,
            UserFlag::Deaf => self.deaf,
            UserFlag::Suppress => self.suppress,
            UserFlag::SelfMute => self.self_mute,
            UserFlag::SelfDeaf => self.self_deaf,
            UserFlag::Recording => self.recording,
            UserFlag::PrioritySpeaker => self.priority_speaker,
        }
    }

    fn flag_mut(&mut self, flag: UserFlag) -> &mut bool {
        match flag {
            UserFlag::Mute => &mut self.mute,
            UserFlag::Deaf => &mut self.deaf,
            UserFlag::Suppress => &mut self.suppress,
            UserFlag::SelfMute => &mut self.self_mute,
            UserFlag::SelfDeaf => &mut self.self_deaf,
            UserFlag::Recording => &mut self.recording,
            UserFlag::PrioritySpeaker => &mut self.priority_speaker,
        }
    }
}

/// Boolean user attributes that raise their own change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserFlag {
    Mute,
    Deaf,
    Suppress,
    SelfMute,
    SelfDeaf,
    Recording,
    PrioritySpeaker,
}

impl UserFlag {
    fn from_delta(msg: &UserState) -> [(UserFlag, Option<bool>); 7] {
        [
            (UserFlag::Mute, msg.mute),
            (UserFlag::Deaf, msg.deaf),
            (UserFlag::Suppress, msg.suppress),
            (UserFlag::SelfMute, msg.self_mute),
            (UserFlag::SelfDeaf, msg.self_deaf),
            (UserFlag::Recording, msg.recording),
            (UserFlag::PrioritySpeaker, msg.priority_speaker),
        ]
    }
}

/// What a delta did to the tree. Entity payloads are post-change snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    ChannelCreated(Channel),
    ChannelUpdated(Channel),
    ChannelMoved {
        channel: u32,
        from: Option<u32>,
        to: u32,
    },
    ChannelLinksAdded {
        channel: u32,
        links: Vec<u32>,
    },
    ChannelLinksRemoved {
        channel: u32,
        links: Vec<u32>,
    },
    /// Snapshot taken just before removal.
    ChannelRemoved(Channel),
    ChannelPermissions {
        channel: u32,
        permissions: u32,
    },
    UserConnected(User),
    UserUpdated(User),
    UserMoved {
        session: u32,
        from: u32,
        to: u32,
        actor: Option<u32>,
    },
    UserFlagChanged {
        session: u32,
        flag: UserFlag,
        value: bool,
    },
    UserDisconnected {
        user: User,
        actor: Option<u32>,
        reason: Option<String>,
        ban: bool,
    },
}

/// Channels and users keyed by id, rooted at channel 0.
#[derive(Debug, Clone)]
pub struct StateTree {
    channels: BTreeMap<u32, Channel>,
    users: BTreeMap<u32, User>,
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    pub fn new() -> Self {
        let mut channels = BTreeMap::new();
        let mut root = Channel::new(ROOT_CHANNEL, None);
        root.name = "Root".to_string();
        channels.insert(ROOT_CHANNEL, root);
        Self {
            channels,
            users: BTreeMap::new(),
        }
    }

    /// Drop everything but an empty root.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn root(&self) -> &Channel {
        &self.channels[&ROOT_CHANNEL]
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn user(&self, session: u32) -> Option<&User> {
        self.users.get(&session)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Lowest-id channel with the given name.
    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.channels.values().find(|c| c.name == name)
    }

    /// Resolve a `/`-separated path of channel names below the root.
    ///
    /// Empty segments are skipped, so `""` and `"/"` name the root.
    pub fn channel_by_path(&self, path: &str) -> Option<&Channel> {
        let mut current = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .children
                .iter()
                .filter_map(|id| self.channels.get(id))
                .find(|c| c.name == segment)?;
        }
        Some(current)
    }

    /// Ids from the root down to `id`, inclusive.
    pub fn ancestry(&self, id: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut current = self.channels.get(&id);
        while let Some(channel) = current {
            chain.push(channel.id);
            // Bound the walk in case of a corrupted parent chain.
            if chain.len() > self.channels.len() {
                break;
            }
            current = channel.parent.and_then(|p| self.channels.get(&p));
        }
        chain.reverse();
        chain
    }

    /// Names below the root joined with `/`, the inverse of [`Self::channel_by_path`].
    pub fn channel_path(&self, id: u32) -> Option<String> {
        self.channels.get(&id)?;
        let names: Vec<&str> = self
            .ancestry(id)
            .into_iter()
            .skip(1)
            .filter_map(|c| self.channels.get(&c).map(|c| c.name.as_str()))
            .collect();
        Some(names.join("/"))
    }

    /// Direct children ordered by position, ties broken by id.
    pub fn children(&self, id: u32) -> Vec<&Channel> {
        let mut children: Vec<&Channel> = self
            .channels
            .get(&id)
            .map(|c| c.children.iter().filter_map(|id| self.channels.get(id)).collect())
            .unwrap_or_default();
        children.sort_by_key(|c| (c.position, c.id));
        children
    }

    /// Every channel below `id`, depth first.
    pub fn descendants(&self, id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack: Vec<u32> = self
            .channels
            .get(&id)
            .map(|c| c.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(channel) = self.channels.get(&next) {
                stack.extend(channel.children.iter().rev().copied());
            }
        }
        out
    }

    /// True if `ancestor` is `id` or lies on its parent chain.
    pub fn is_ancestor(&self, ancestor: u32, id: u32) -> bool {
        self.ancestry(id).contains(&ancestor)
    }

    /// Users currently in channel `id`, by session.
    pub fn users_in(&self, id: u32) -> Vec<&User> {
        self.users.values().filter(|u| u.channel_id == id).collect()
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|u| u.name == name)
    }

    pub fn user_by_id(&self, user_id: u32) -> Option<&User> {
        self.users.values().find(|u| u.user_id == Some(user_id))
    }

    /// Merge a `ChannelState` delta, creating the channel if unseen.
    pub fn apply_channel_state(&mut self, msg: &ChannelState) -> Vec<StateChange> {
        let Some(id) = msg.channel_id else {
            tracing::warn!("ChannelState without channel_id ignored");
            return Vec::new();
        };
        let mut changes = Vec::new();
        let created = !self.channels.contains_key(&id);

        if created {
            let parent = match msg.parent {
                Some(parent) if parent != id && self.channels.contains_key(&parent) => parent,
                other => {
                    tracing::warn!(
                        channel = id,
                        parent = ?other,
                        "channel parent unknown, attaching to root"
                    );
                    ROOT_CHANNEL
                }
            };
            self.channels.insert(id, Channel::new(id, Some(parent)));
            if let Some(parent) = self.channels.get_mut(&parent) {
                parent.children.insert(id);
            }
        } else if let Some(parent) = msg.parent {
            if let Some(change) = self.reparent_channel(id, parent) {
                changes.push(change);
            }
        }

        let mut updated = false;
        if let Some(channel) = self.channels.get_mut(&id) {
            if let Some(name) = &msg.name {
                updated |= channel.name != *name;
                channel.name = name.clone();
            }
            if let Some(description) = &msg.description {
                updated |= channel.description.as_ref() != Some(description);
                channel.description = Some(description.clone());
            }
            if let Some(temporary) = msg.temporary {
                updated |= channel.temporary != temporary;
                channel.temporary = temporary;
            }
            if let Some(position) = msg.position {
                updated |= channel.position != position;
                channel.position = position;
            }
            if let Some(max_users) = msg.max_users {
                updated |= channel.max_users != Some(max_users);
                channel.max_users = Some(max_users);
            }
        }

        let (added, removed) = self.apply_links(id, msg);

        if created {
            if let Some(channel) = self.channels.get(&id) {
                changes.insert(0, StateChange::ChannelCreated(channel.clone()));
            }
            return changes;
        }
        if updated {
            if let Some(channel) = self.channels.get(&id) {
                changes.push(StateChange::ChannelUpdated(channel.clone()));
            }
        }
        if !added.is_empty() {
            changes.push(StateChange::ChannelLinksAdded {
                channel: id,
                links: added,
            });
        }
        if !removed.is_empty() {
            changes.push(StateChange::ChannelLinksRemoved {
                channel: id,
                links: removed,
            });
        }
        changes
    }

    fn reparent_channel(&mut self, id: u32, parent: u32) -> Option<StateChange> {
        let current = self.channels.get(&id)?.parent;
        if current == Some(parent) {
            return None;
        }
        if id == ROOT_CHANNEL {
            tracing::warn!(parent, "ignoring attempt to move the root channel");
            return None;
        }
        if !self.channels.contains_key(&parent) {
            tracing::warn!(channel = id, parent, "move to unknown parent ignored");
            return None;
        }
        if self.is_ancestor(id, parent) {
            tracing::warn!(channel = id, parent, "move would create a cycle, ignored");
            return None;
        }
        self.attach(id, parent);
        Some(StateChange::ChannelMoved {
            channel: id,
            from: current,
            to: parent,
        })
    }

    fn attach(&mut self, id: u32, parent: u32) {
        let previous = self.channels.get_mut(&id).and_then(|c| c.parent.replace(parent));
        if let Some(previous) = previous.and_then(|p| self.channels.get_mut(&p)) {
            previous.children.remove(&id);
        }
        if let Some(parent) = self.channels.get_mut(&parent) {
            parent.children.insert(id);
        }
    }

    fn apply_links(&mut self, id: u32, msg: &ChannelState) -> (Vec<u32>, Vec<u32>) {
        let mut add: BTreeSet<u32> = msg.links_add.iter().copied().collect();
        let mut remove: BTreeSet<u32> = msg.links_remove.iter().copied().collect();
        if !msg.links.is_empty() {
            let wanted: BTreeSet<u32> = msg.links.iter().copied().collect();
            let existing = self.channels.get(&id).map(|c| c.links.clone()).unwrap_or_default();
            add.extend(wanted.difference(&existing));
            remove.extend(existing.difference(&wanted));
        }

        let mut added = Vec::new();
        for other in add {
            if other == id || !self.channels.contains_key(&other) {
                tracing::warn!(channel = id, link = other, "skipping link to unknown channel");
                continue;
            }
            if self.link(id, other) {
                added.push(other);
            }
        }
        let mut removed = Vec::new();
        for other in remove {
            if self.unlink(id, other) {
                removed.push(other);
            }
        }
        (added, removed)
    }

    fn link(&mut self, a: u32, b: u32) -> bool {
        let inserted = self.channels.get_mut(&a).is_some_and(|c| c.links.insert(b));
        if let Some(other) = self.channels.get_mut(&b) {
            other.links.insert(a);
        }
        inserted
    }

    fn unlink(&mut self, a: u32, b: u32) -> bool {
        let removed = self.channels.get_mut(&a).is_some_and(|c| c.links.remove(&b));
        if let Some(other) = self.channels.get_mut(&b) {
            other.links.remove(&a);
        }
        removed
    }

    /// Remove a channel, repairing anything that still points at it.
    pub fn apply_channel_remove(&mut self, msg: &ChannelRemove) -> Vec<StateChange> {
        let id = msg.channel_id;
        if id == ROOT_CHANNEL {
            tracing::warn!("ignoring removal of the root channel");
            return Vec::new();
        }
        let Some(channel) = self.channels.get(&id).cloned() else {
            tracing::warn!(channel = id, "removal of unknown channel ignored");
            return Vec::new();
        };
        let parent = channel.parent.unwrap_or(ROOT_CHANNEL);
        let mut changes = Vec::new();

        for child in &channel.children {
            tracing::warn!(channel = id, child, "removed channel still had children, re-parenting");
            self.attach(*child, parent);
            changes.push(StateChange::ChannelMoved {
                channel: *child,
                from: Some(id),
                to: parent,
            });
        }
        for user in self.users.values_mut().filter(|u| u.channel_id == id) {
            tracing::warn!(
                channel = id,
                session = user.session,
                "removed channel still had users, moving to parent"
            );
            user.channel_id = parent;
            changes.push(StateChange::UserMoved {
                session: user.session,
                from: id,
                to: parent,
                actor: None,
            });
        }
        for other in &channel.links {
            if let Some(linked) = self.channels.get_mut(other) {
                linked.links.remove(&id);
            }
        }
        if let Some(parent) = self.channels.get_mut(&parent) {
            parent.children.remove(&id);
        }

        let removed = self.channels.remove(&id).unwrap_or(channel);
        changes.push(StateChange::ChannelRemoved(removed));
        changes
    }

    /// Merge a `UserState` delta, creating the user if unseen.
    pub fn apply_user_state(&mut self, msg: &UserState) -> Vec<StateChange> {
        let Some(session) = msg.session else {
            tracing::warn!("UserState without session ignored");
            return Vec::new();
        };
        let target_channel = msg.channel_id.map(|channel| {
            if self.channels.contains_key(&channel) {
                channel
            } else {
                tracing::warn!(session, channel, "user placed in unknown channel, using root");
                ROOT_CHANNEL
            }
        });

        let Some(user) = self.users.get_mut(&session) else {
            let mut user = User {
                session,
                channel_id: target_channel.unwrap_or(ROOT_CHANNEL),
                ..Default::default()
            };
            merge_user_fields(&mut user, msg);
            for (flag, value) in UserFlag::from_delta(msg) {
                if let Some(value) = value {
                    *user.flag_mut(flag) = value;
                }
            }
            self.users.insert(session, user.clone());
            return vec![StateChange::UserConnected(user)];
        };

        let mut changes = Vec::new();
        let updated = merge_user_fields(user, msg);
        for (flag, value) in UserFlag::from_delta(msg) {
            let Some(value) = value else { continue };
            let slot = user.flag_mut(flag);
            if *slot != value {
                *slot = value;
                changes.push(StateChange::UserFlagChanged {
                    session,
                    flag,
                    value,
                });
            }
        }
        if let Some(to) = target_channel {
            if user.channel_id != to {
                let from = std::mem::replace(&mut user.channel_id, to);
                changes.push(StateChange::UserMoved {
                    session,
                    from,
                    to,
                    actor: msg.actor,
                });
            }
        }
        if updated {
            changes.push(StateChange::UserUpdated(user.clone()));
        }
        changes
    }

    pub fn apply_user_remove(&mut self, msg: &UserRemove) -> Vec<StateChange> {
        match self.users.remove(&msg.session) {
            Some(user) => vec![StateChange::UserDisconnected {
                user,
                actor: msg.actor,
                reason: msg.reason.clone(),
                ban: msg.ban.unwrap_or(false),
            }],
            None => {
                tracing::warn!(session = msg.session, "removal of unknown user ignored");
                Vec::new()
            }
        }
    }

    /// Update the permission cache.
    ///
    /// A `flush` drops every cached value. Otherwise the channel and all of
    /// its descendants are invalidated before the new bits are stored.
    pub fn apply_permission_query(&mut self, msg: &PermissionQuery) -> Vec<StateChange> {
        if msg.flush.unwrap_or(false) {
            for channel in self.channels.values_mut() {
                channel.permissions = None;
            }
        }
        let Some(id) = msg.channel_id else {
            return Vec::new();
        };
        if !self.channels.contains_key(&id) {
            tracing::warn!(channel = id, "permissions for unknown channel ignored");
            return Vec::new();
        }
        for descendant in self.descendants(id) {
            if let Some(channel) = self.channels.get_mut(&descendant) {
                channel.permissions = None;
            }
        }
        let permissions = msg.permissions;
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.permissions = permissions;
        }
        match permissions {
            Some(permissions) => vec![StateChange::ChannelPermissions {
                channel: id,
                permissions,
            }],
            None => Vec::new(),
        }
    }

    /// Describe every broken structural invariant; empty when consistent.
    pub fn check_consistency(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.root().parent.is_some() {
            problems.push("root has a parent".to_string());
        }
        for channel in self.channels.values() {
            if !channel.is_root() {
                match channel.parent {
                    Some(parent) => match self.channels.get(&parent) {
                        Some(p) if p.children.contains(&channel.id) => {}
                        Some(_) => problems.push(format!(
                            "channel {} missing from its parent's children",
                            channel.id
                        )),
                        None => problems.push(format!(
                            "channel {} has unknown parent {parent}",
                            channel.id
                        )),
                    },
                    None => problems.push(format!("channel {} has no parent", channel.id)),
                }
                if self.ancestry(channel.id).first() != Some(&ROOT_CHANNEL) {
                    problems.push(format!("channel {} is not reachable from root", channel.id));
                }
            }
            for child in &channel.children {
                if self.channels.get(child).and_then(|c| c.parent) != Some(channel.id) {
                    problems.push(format!(
                        "child {child} of {} disagrees about its parent",
                        channel.id
                    ));
                }
            }
            for link in &channel.links {
                if !self
                    .channels
                    .get(link)
                    .is_some_and(|l| l.links.contains(&channel.id))
                {
                    problems.push(format!("link {} -> {link} is not symmetric", channel.id));
                }
            }
        }
        for user in self.users.values() {
            if !self.channels.contains_key(&user.channel_id) {
                problems.push(format!(
                    "user {} is in unknown channel {}",
                    user.session, user.channel_id
                ));
            }
        }
        problems
    }
}

/// Merge non-flag attributes; returns true if anything changed.
fn merge_user_fields(user: &mut User, msg: &UserState) -> bool {
    let mut changed = false;
    if let Some(name) = &msg.name {
        changed |= user.name != *name;
        user.name = name.clone();
    }
    if let Some(user_id) = msg.user_id {
        changed |= user.user_id != Some(user_id);
        user.user_id = Some(user_id);
    }
    if let Some(comment) = &msg.comment {
        changed |= user.comment.as_ref() != Some(comment);
        user.comment = Some(comment.clone());
    }
    if let Some(hash) = &msg.hash {
        changed |= user.hash.as_ref() != Some(hash);
        user.hash = Some(hash.clone());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: u32, parent: u32, name: &str) -> ChannelState {
        ChannelState {
            channel_id: Some(id),
            parent: Some(parent),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn user(session: u32, channel: u32, name: &str) -> UserState {
        UserState {
            session: Some(session),
            channel_id: Some(channel),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn sample_tree() -> StateTree {
        let mut tree = StateTree::new();
        tree.apply_channel_state(&channel(1, 0, "Lobby"));
        tree.apply_channel_state(&channel(2, 1, "Games"));
        tree.apply_channel_state(&channel(3, 2, "Chess"));
        tree.apply_user_state(&user(5, 1, "alice"));
        tree.apply_user_state(&user(6, 3, "bob"));
        tree
    }

    #[test]
    fn creation_then_merge_preserves_absent_fields() {
        let mut tree = StateTree::new();
        let changes = tree.apply_channel_state(&ChannelState {
            description: Some("hello".into()),
            max_users: Some(10),
            ..channel(1, 0, "Lobby")
        });
        assert!(matches!(&changes[..], [StateChange::ChannelCreated(c)] if c.name == "Lobby"));

        let changes = tree.apply_channel_state(&ChannelState {
            channel_id: Some(1),
            position: Some(4),
            ..Default::default()
        });
        assert!(matches!(&changes[..], [StateChange::ChannelUpdated(c)] if c.position == 4));
        let lobby = tree.channel(1).unwrap();
        assert_eq!(lobby.name, "Lobby");
        assert_eq!(lobby.description.as_deref(), Some("hello"));
        assert_eq!(lobby.max_users, Some(10));
        assert!(tree.root().children.contains(&1));
    }

    #[test]
    fn unknown_parent_attaches_to_root() {
        let mut tree = StateTree::new();
        tree.apply_channel_state(&channel(9, 42, "Stray"));
        assert_eq!(tree.channel(9).unwrap().parent, Some(ROOT_CHANNEL));
        assert!(tree.check_consistency().is_empty());
    }

    #[test]
    fn cyclic_move_is_ignored() {
        let mut tree = sample_tree();
        let changes = tree.apply_channel_state(&ChannelState {
            channel_id: Some(1),
            parent: Some(3),
            ..Default::default()
        });
        assert!(changes.is_empty());
        assert_eq!(tree.channel(1).unwrap().parent, Some(0));
        assert!(tree.check_consistency().is_empty());
    }

    #[test]
    fn move_reports_old_and_new_parent() {
        let mut tree = sample_tree();
        let changes = tree.apply_channel_state(&ChannelState {
            channel_id: Some(3),
            parent: Some(1),
            ..Default::default()
        });
        assert_eq!(
            changes,
            vec![StateChange::ChannelMoved {
                channel: 3,
                from: Some(2),
                to: 1
            }]
        );
        assert!(!tree.channel(2).unwrap().children.contains(&3));
        assert_eq!(tree.channel_path(3).as_deref(), Some("Lobby/Chess"));
    }

    #[test]
    fn links_stay_symmetric() {
        let mut tree = sample_tree();
        let changes = tree.apply_channel_state(&ChannelState {
            channel_id: Some(1),
            links_add: vec![2, 3, 77],
            ..Default::default()
        });
        assert_eq!(
            changes,
            vec![StateChange::ChannelLinksAdded {
                channel: 1,
                links: vec![2, 3]
            }]
        );
        assert!(tree.channel(3).unwrap().links.contains(&1));

        // A full set replaces the current links.
        let changes = tree.apply_channel_state(&ChannelState {
            channel_id: Some(1),
            links: vec![2],
            ..Default::default()
        });
        assert_eq!(
            changes,
            vec![StateChange::ChannelLinksRemoved {
                channel: 1,
                links: vec![3]
            }]
        );
        assert!(!tree.channel(3).unwrap().links.contains(&1));
        assert!(tree.check_consistency().is_empty());
    }

    #[test]
    fn removing_a_channel_repairs_children_users_and_links() {
        let mut tree = sample_tree();
        tree.apply_channel_state(&ChannelState {
            channel_id: Some(2),
            links_add: vec![1],
            ..Default::default()
        });

        let changes = tree.apply_channel_remove(&ChannelRemove { channel_id: 2 });
        assert_eq!(
            changes[0],
            StateChange::ChannelMoved {
                channel: 3,
                from: Some(2),
                to: 1
            }
        );
        assert!(matches!(changes.last(), Some(StateChange::ChannelRemoved(c)) if c.id == 2));
        assert!(tree.channel(2).is_none());
        assert_eq!(tree.channel(3).unwrap().parent, Some(1));
        assert!(tree.channel(1).unwrap().links.is_empty());
        assert!(tree.check_consistency().is_empty());
    }

    #[test]
    fn removing_occupied_channel_moves_users_up() {
        let mut tree = sample_tree();
        let changes = tree.apply_channel_remove(&ChannelRemove { channel_id: 3 });
        assert!(changes.contains(&StateChange::UserMoved {
            session: 6,
            from: 3,
            to: 2,
            actor: None
        }));
        assert_eq!(tree.user(6).unwrap().channel_id, 2);
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut tree = sample_tree();
        assert!(tree.apply_channel_remove(&ChannelRemove { channel_id: 0 }).is_empty());
        assert!(tree.channel(0).is_some());
    }

    #[test]
    fn user_delta_reports_flags_and_moves() {
        let mut tree = sample_tree();
        let changes = tree.apply_user_state(&UserState {
            session: Some(5),
            actor: Some(6),
            channel_id: Some(2),
            self_mute: Some(true),
            mute: Some(false),
            ..Default::default()
        });
        assert_eq!(
            changes,
            vec![
                StateChange::UserFlagChanged {
                    session: 5,
                    flag: UserFlag::SelfMute,
                    value: true
                },
                StateChange::UserMoved {
                    session: 5,
                    from: 1,
                    to: 2,
                    actor: Some(6)
                },
            ]
        );
        let alice = tree.user(5).unwrap();
        assert_eq!(alice.name, "alice");
        assert!(!alice.can_talk());
        assert!(alice.can_hear());
    }

    #[test]
    fn user_in_unknown_channel_lands_in_root() {
        let mut tree = StateTree::new();
        tree.apply_user_state(&user(8, 99, "carol"));
        assert_eq!(tree.user(8).unwrap().channel_id, ROOT_CHANNEL);
        assert!(tree.check_consistency().is_empty());
    }

    #[test]
    fn user_moved_into_removed_channel_lands_in_root() {
        let mut tree = sample_tree();
        tree.apply_channel_remove(&ChannelRemove { channel_id: 3 });
        let changes = tree.apply_user_state(&UserState {
            session: Some(5),
            channel_id: Some(3),
            ..Default::default()
        });
        assert_eq!(
            changes,
            vec![StateChange::UserMoved {
                session: 5,
                from: 1,
                to: ROOT_CHANNEL,
                actor: None,
            }]
        );
        assert_eq!(tree.user(5).unwrap().channel_id, ROOT_CHANNEL);
        assert!(tree.check_consistency().is_empty());
    }

    #[test]
    fn user_remove_emits_single_disconnect() {
        let mut tree = sample_tree();
        let changes = tree.apply_user_remove(&UserRemove {
            session: 5,
            reason: Some("bye".into()),
            ..Default::default()
        });
        assert!(matches!(
            &changes[..],
            [StateChange::UserDisconnected { user, reason: Some(r), ban: false, .. }]
                if user.session == 5 && r == "bye"
        ));
        assert!(tree.user(5).is_none());
        assert!(tree.user_by_name("alice").is_none());
        let again = tree.apply_user_remove(&UserRemove {
            session: 5,
            ..Default::default()
        });
        assert!(again.is_empty());
    }

    #[test]
    fn lookups_by_path_name_and_id() {
        let mut tree = sample_tree();
        tree.apply_user_state(&UserState {
            session: Some(6),
            user_id: Some(12),
            ..Default::default()
        });
        assert_eq!(tree.channel_by_path("Lobby/Games/Chess").map(|c| c.id), Some(3));
        assert_eq!(tree.channel_by_path("/").map(|c| c.id), Some(0));
        assert!(tree.channel_by_path("Lobby/Nope").is_none());
        assert_eq!(tree.channel_by_name("Games").map(|c| c.id), Some(2));
        assert_eq!(tree.user_by_id(12).map(|u| u.session), Some(6));
        assert_eq!(tree.ancestry(3), vec![0, 1, 2, 3]);
        assert_eq!(tree.descendants(1), vec![2, 3]);
        assert_eq!(tree.users_in(1).len(), 1);
    }

    #[test]
    fn children_sorted_by_position_then_id() {
        let mut tree = StateTree::new();
        tree.apply_channel_state(&ChannelState {
            position: Some(5),
            ..channel(1, 0, "b")
        });
        tree.apply_channel_state(&channel(3, 0, "c"));
        tree.apply_channel_state(&channel(2, 0, "a"));
        let order: Vec<u32> = tree.children(0).iter().map(|c| c.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn permission_update_invalidates_descendants() {
        let mut tree = sample_tree();
        for id in [1, 2, 3] {
            tree.apply_permission_query(&PermissionQuery {
                channel_id: Some(id),
                permissions: Some(0x1),
                flush: None,
            });
        }
        let changes = tree.apply_permission_query(&PermissionQuery {
            channel_id: Some(1),
            permissions: Some(0xF),
            flush: None,
        });
        assert_eq!(
            changes,
            vec![StateChange::ChannelPermissions {
                channel: 1,
                permissions: 0xF
            }]
        );
        assert_eq!(tree.channel(1).unwrap().permissions, Some(0xF));
        assert_eq!(tree.channel(2).unwrap().permissions, None);
        assert_eq!(tree.channel(3).unwrap().permissions, None);

        tree.apply_permission_query(&PermissionQuery {
            flush: Some(true),
            ..Default::default()
        });
        assert!(tree.channels().all(|c| c.permissions.is_none()));
    }

    #[test]
    fn clear_resets_to_root() {
        let mut tree = sample_tree();
        tree.clear();
        assert_eq!(tree.channel_count(), 1);
        assert_eq!(tree.user_count(), 0);
    }

    mod delta_sequences {
        use super::*;
        use proptest::collection::vec;
        use proptest::option;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Delta {
            Channel {
                id: u32,
                parent: Option<u32>,
                links_add: Vec<u32>,
                links_remove: Vec<u32>,
            },
            ChannelGone(u32),
            User {
                session: u32,
                channel: Option<u32>,
            },
            UserGone(u32),
        }

        fn delta() -> impl Strategy<Value = Delta> {
            prop_oneof![
                (0u32..8, option::of(0u32..8), vec(0u32..8, 0..3), vec(0u32..8, 0..3)).prop_map(
                    |(id, parent, links_add, links_remove)| Delta::Channel {
                        id,
                        parent,
                        links_add,
                        links_remove,
                    }
                ),
                (0u32..8).prop_map(Delta::ChannelGone),
                (1u32..5, option::of(0u32..8))
                    .prop_map(|(session, channel)| Delta::User { session, channel }),
                (1u32..5).prop_map(Delta::UserGone),
            ]
        }

        fn apply(tree: &mut StateTree, delta: &Delta) {
            match delta {
                Delta::Channel {
                    id,
                    parent,
                    links_add,
                    links_remove,
                } => {
                    tree.apply_channel_state(&ChannelState {
                        channel_id: Some(*id),
                        parent: *parent,
                        links_add: links_add.clone(),
                        links_remove: links_remove.clone(),
                        ..Default::default()
                    });
                }
                Delta::ChannelGone(id) => {
                    tree.apply_channel_remove(&ChannelRemove { channel_id: *id });
                }
                Delta::User { session, channel } => {
                    tree.apply_user_state(&UserState {
                        session: Some(*session),
                        channel_id: *channel,
                        ..Default::default()
                    });
                }
                Delta::UserGone(session) => {
                    tree.apply_user_remove(&UserRemove {
                        session: *session,
                        ..Default::default()
                    });
                }
            }
        }

        proptest! {
            #[test]
            fn every_intermediate_tree_is_consistent(deltas in vec(delta(), 1..64)) {
                let mut tree = StateTree::new();
                for delta in &deltas {
                    apply(&mut tree, delta);
                    let problems = tree.check_consistency();
                    prop_assert!(problems.is_empty(), "{:?} after {:?}", problems, delta);
                    prop_assert!(tree.channel(ROOT_CHANNEL).is_some());
                }
            }
        }
    }
}
