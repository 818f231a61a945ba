//! In-memory binding store.
//!
//! Bindings live only as long as the process, so a session released from
//! memory could never be loaded again; the store therefore reports every
//! bound session as held.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runtime_manager_types::{
    Binding, Context, CorrelationKey, InstanceId, ManagerId, Mapper, MapperError, MapperResult,
    SessionId,
};
use std::collections::BTreeSet;

/// Binding store backed by concurrent maps
pub struct InMemoryMapper {
    /// Bindings indexed by owning manager and context
    bindings: DashMap<(ManagerId, Context), Binding>,

    /// The one context claiming each session
    claims: DashMap<(ManagerId, SessionId), Context>,

    /// Waiting contexts per event type, in registration order
    interest: DashMap<(ManagerId, String), Vec<Context>>,
}

impl InMemoryMapper {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
            claims: DashMap::new(),
            interest: DashMap::new(),
        }
    }

    /// Number of bindings across all managers
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings owned by `manager`
    pub fn bindings(&self, manager: &ManagerId) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self
            .bindings
            .iter()
            .filter(|entry| &entry.key().0 == manager)
            .map(|entry| entry.value().clone())
            .collect();
        bindings.sort_by_key(|binding| binding.created_at);
        bindings
    }
}

impl Default for InMemoryMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mapper for InMemoryMapper {
    async fn find_mapping(
        &self,
        context: &Context,
        manager: &ManagerId,
    ) -> MapperResult<Option<SessionId>> {
        Ok(self
            .bindings
            .get(&(manager.clone(), context.clone()))
            .map(|binding| binding.session_id))
    }

    async fn save_mapping(
        &self,
        context: &Context,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        if context.is_empty() {
            return Err(MapperError::InvalidInput(
                "the empty context cannot be bound".to_string(),
            ));
        }
        let mut claim = self
            .claims
            .entry((manager.clone(), session))
            .or_insert_with(|| context.clone());
        if claim.value() != context {
            let takes_over = matches!(claim.value(), Context::CorrelationKey(_))
                && matches!(context, Context::InstanceId(_));
            if !takes_over {
                return Err(MapperError::Conflict(format!(
                    "{session} already serves {}",
                    claim.value()
                )));
            }
            *claim.value_mut() = context.clone();
        }

        // Written while the claim is held so a competing save sees both
        let previous = self.bindings.insert(
            (manager.clone(), context.clone()),
            Binding::new(context.clone(), session, manager.clone()),
        );
        drop(claim);

        if let Some(previous) = previous.filter(|binding| binding.session_id != session) {
            self.claims
                .remove_if(&(manager.clone(), previous.session_id), |_, owner| {
                    owner == context
                });
        }
        Ok(())
    }

    async fn save_alias(
        &self,
        key: &CorrelationKey,
        instance: InstanceId,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        let owner = Context::InstanceId(instance);
        let session = self
            .bindings
            .get(&(manager.clone(), owner.clone()))
            .map(|binding| binding.session_id)
            .ok_or_else(|| MapperError::InvalidInput(format!("{owner} is not bound")))?;

        let alias = Context::CorrelationKey(key.clone());
        match self.bindings.entry((manager.clone(), alias.clone())) {
            Entry::Occupied(existing) if existing.get().session_id != session => {
                Err(MapperError::Conflict(format!(
                    "{alias} is bound to {}, not to {owner}",
                    existing.get().session_id
                )))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(Binding::new(alias, session, manager.clone()));
                Ok(())
            }
        }
    }

    async fn remove_mapping(&self, context: &Context, manager: &ManagerId) -> MapperResult<()> {
        if let Some((_, binding)) = self.bindings.remove(&(manager.clone(), context.clone())) {
            self.claims
                .remove_if(&(manager.clone(), binding.session_id), |_, owner| {
                    owner == context
                });
        }
        for mut waiting in self.interest.iter_mut() {
            if &waiting.key().0 == manager {
                waiting.value_mut().retain(|waiter| waiter != context);
            }
        }
        self.interest.retain(|_, waiting| !waiting.is_empty());
        Ok(())
    }

    async fn find_contexts_waiting_for_event(
        &self,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<Vec<Context>> {
        Ok(self
            .interest
            .get(&(manager.clone(), event_type.to_string()))
            .map(|waiting| waiting.clone())
            .unwrap_or_default())
    }

    async fn find_context_id(
        &self,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<Option<Context>> {
        Ok(self
            .claims
            .get(&(manager.clone(), session))
            .map(|owner| owner.value().clone()))
    }

    async fn find_sessions_pending_init(
        &self,
        manager: &ManagerId,
    ) -> MapperResult<Vec<SessionId>> {
        let sessions: BTreeSet<SessionId> = self
            .bindings
            .iter()
            .filter(|entry| &entry.key().0 == manager)
            .map(|entry| entry.value().session_id)
            .collect();
        Ok(sessions.into_iter().collect())
    }

    async fn register_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        let mut waiting = self
            .interest
            .entry((manager.clone(), event_type.to_string()))
            .or_default();
        if !waiting.contains(context) {
            waiting.push(context.clone());
        }
        Ok(())
    }

    async fn clear_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        let key = (manager.clone(), event_type.to_string());
        if let Some(mut waiting) = self.interest.get_mut(&key) {
            waiting.retain(|waiter| waiter != context);
        }
        self.interest.remove_if(&key, |_, waiting| waiting.is_empty());
        Ok(())
    }

    async fn holds_session(&self, session: SessionId, manager: &ManagerId) -> MapperResult<bool> {
        Ok(self
            .bindings
            .iter()
            .any(|entry| &entry.key().0 == manager && entry.value().session_id == session))
    }
}
