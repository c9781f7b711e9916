//! Bot instance lifecycle: port allocation, container provisioning, teardown.
//!
//! Provisioning and deprovisioning are serialized by one async mutex. A `creating` record is
//! inserted before any container work so the port is reserved by the store's uniqueness check;
//! any later failure removes the container and deletes the record before returning.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::models::{BotId, BotInstance, InstanceId, InstanceStatus, NewBotInstance, OrganizationId};
use crate::runtime::{ContainerError, ContainerRuntime, ContainerSpec};
use crate::store::DirectoryStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A request to start a dedicated runtime for one served number.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub organization_id: OrganizationId,
    /// Instance name; the container is named `{prefix}{name}`.
    pub name: String,
    pub based_on_bot_id: Option<BotId>,
    pub whatsapp_number: String,
    /// Desired host port; allocated when absent.
    pub port: Option<u16>,
}

impl ProvisionRequest {
    /// Field-level validation, before any state is touched.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::invalid("name", "must not be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(Error::invalid(
                "name",
                "may contain only letters, digits, '_', '-' and '.'",
            ));
        }
        if self.whatsapp_number.trim().is_empty() {
            return Err(Error::invalid("whatsapp_number", "must not be empty"));
        }
        if self.whatsapp_number.contains('@') {
            return Err(Error::invalid(
                "whatsapp_number",
                "must be a bare number without an address suffix",
            ));
        }
        if self.port == Some(0) {
            return Err(Error::invalid("port", "must be between 1 and 65535"));
        }
        Ok(())
    }
}

pub struct InstanceManager {
    store: Arc<dyn DirectoryStore>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: RuntimeConfig,
    instance_host: String,
    provision_lock: Mutex<()>,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: RuntimeConfig,
        instance_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runtime,
            settings,
            instance_host: instance_host.into(),
            provision_lock: Mutex::new(()),
        }
    }

    fn action_port(&self, port: u16) -> Option<u16> {
        port.checked_add(self.settings.action_port_offset)
    }

    /// Host and action ports bound by existing instances.
    async fn bound_ports(&self) -> Result<(Vec<u16>, HashSet<u16>)> {
        let hosts = self.store.assigned_ports().await?;
        let bound = hosts
            .iter()
            .flat_map(|&p| [Some(p), self.action_port(p)])
            .flatten()
            .collect();
        Ok((hosts, bound))
    }

    /// Highest assigned port + 1 (the base port when no instance exists), moved up past any
    /// port whose host or action port is already bound.
    pub async fn allocate_port(&self) -> Result<u16> {
        let (hosts, bound) = self.bound_ports().await?;
        let mut candidate = match hosts.iter().max() {
            None => Some(self.settings.base_port),
            Some(highest) => highest.checked_add(1),
        };
        while let Some(port) = candidate {
            let Some(action) = self.action_port(port) else {
                break;
            };
            if !bound.contains(&port) && !bound.contains(&action) {
                return Ok(port);
            }
            candidate = port.checked_add(1);
        }
        Err(Error::ResourceExhausted(
            "no free host/action port pair below 65535".to_string(),
        ))
    }

    /// Reserve a port, create and start the container, mark the record running.
    pub async fn provision(&self, req: ProvisionRequest) -> Result<BotInstance> {
        req.validate()?;
        let _guard = self.provision_lock.lock().await;

        let port = match req.port {
            Some(p) => {
                let Some(action) = self.action_port(p) else {
                    return Err(Error::invalid(
                        "port",
                        format!("port + {} exceeds 65535", self.settings.action_port_offset),
                    ));
                };
                let (_, bound) = self.bound_ports().await?;
                if bound.contains(&p) || bound.contains(&action) {
                    return Err(Error::Conflict(format!(
                        "port {} or its action port {} is already bound",
                        p, action
                    )));
                }
                p
            }
            None => self.allocate_port().await?,
        };
        let org = req.organization_id;
        let name = format!("{}{}", self.settings.name_prefix, req.name.trim());

        let reserved = self
            .store
            .insert_instance(NewBotInstance {
                organization_id: org,
                name: name.clone(),
                port,
                status: InstanceStatus::Creating,
                based_on_bot_id: req.based_on_bot_id,
                whatsapp_number: req.whatsapp_number.trim().to_string(),
            })
            .await?;

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.settings.image.clone(),
            host_port: port,
            container_port: self.settings.container_port,
            action_host_port: port + self.settings.action_port_offset,
            action_container_port: self.settings.action_container_port,
            restart_policy: self.settings.restart_policy.clone(),
            command: self.settings.command.clone(),
        };

        let container_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                log::warn!("creating container {} failed: {}", name, e);
                return Err(self.rollback(org, reserved.id, None, e.into()).await);
            }
        };
        if let Err(e) = self.runtime.start(&container_id).await {
            log::warn!("starting container {} failed: {}", name, e);
            return Err(self
                .rollback(org, reserved.id, Some(&container_id), e.into())
                .await);
        }
        match self
            .store
            .update_instance(org, reserved.id, InstanceStatus::Running, Some(&container_id))
            .await
        {
            Ok(instance) => {
                log::info!(
                    "instance {} running on port {} (container {})",
                    instance.name,
                    instance.port,
                    container_id
                );
                Ok(instance)
            }
            Err(e) => Err(self
                .rollback(org, reserved.id, Some(&container_id), e)
                .await),
        }
    }

    /// Undo a partial provision. Returns the error to surface: the original cause, or
    /// `Inconsistency` when cleanup itself failed.
    async fn rollback(
        &self,
        org: OrganizationId,
        id: InstanceId,
        container_id: Option<&str>,
        cause: Error,
    ) -> Error {
        let mut leftovers = Vec::new();
        if let Some(cid) = container_id {
            if let Err(e) = self.remove(cid).await {
                leftovers.push(format!("container {} not removed: {}", cid, e));
            }
        }
        if let Err(e) = self.store.delete_instance(org, id).await {
            leftovers.push(format!("record {} not deleted: {}", id, e));
        }
        if leftovers.is_empty() {
            cause
        } else {
            log::error!("rollback of instance {} incomplete: {}", id, leftovers.join("; "));
            Error::Inconsistency(format!("{} (rollback: {})", cause, leftovers.join("; ")))
        }
    }

    /// Graceful stop within the configured grace period. A missing container is success.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        match self
            .runtime
            .stop(container_id, self.settings.stop_timeout())
            .await
        {
            Ok(()) | Err(ContainerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Forced removal. A missing container is success.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        match self.runtime.remove(container_id).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop, remove, then delete the record.
    pub async fn deprovision(&self, org: OrganizationId, id: InstanceId) -> Result<()> {
        let _guard = self.provision_lock.lock().await;
        let instance = self.get(org, id).await?;
        if !instance.container_id.is_empty() {
            if let Err(e) = self.stop(&instance.container_id).await {
                log::warn!(
                    "stopping container {} failed, forcing removal: {}",
                    instance.container_id,
                    e
                );
            }
            self.remove(&instance.container_id).await?;
        }
        if let Err(e) = self.store.delete_instance(org, id).await {
            log::error!(
                "container {} removed but instance record {} not deleted: {}",
                instance.container_id,
                id,
                e
            );
            return Err(Error::Inconsistency(format!(
                "container for instance {} removed but record remains: {}",
                id, e
            )));
        }
        log::info!("instance {} deprovisioned", instance.name);
        Ok(())
    }

    pub async fn list(&self, org: OrganizationId) -> Result<Vec<BotInstance>> {
        self.store.list_instances(org).await
    }

    pub async fn get(&self, org: OrganizationId, id: InstanceId) -> Result<BotInstance> {
        self.store
            .get_instance(org, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)))
    }

    /// Base URL of the running instance serving `number`, if any.
    pub async fn running_endpoint(&self, org: OrganizationId, number: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .running_instance(org, number)
            .await?
            .map(|i| format!("http://{}:{}", self.instance_host, i.port)))
    }
}
