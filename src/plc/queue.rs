//! PLC exclusivity mediation (spec §4.I): Terminals 2 and 3 never open a
//! Modbus socket, so their `PlcClient` calls become rows in the
//! `valve_ops`/`parameter_ops` tables instead of wire traffic. Grounded
//! on the same claim-and-complete pattern the command tables already use
//! (`poll_recipe_commands`/`claim_recipe_command`).

use super::{PlcClient, PlcCommunicator};
use crate::codec::{DataType, RawValue};
use crate::error::{PlcError, PlcResult};
use crate::store::{ParameterOpKind, ParameterOpRow, Store, ValveOpRow};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// `PlcClient` for Terminals 2 and 3: every call submits a row and polls
/// for `PlcOperationDrain` (running only in Terminal 1) to complete it.
pub struct QueuedPlcClient {
    store: Arc<dyn Store>,
    requested_by: String,
}

impl QueuedPlcClient {
    pub fn new(store: Arc<dyn Store>, requested_by: String) -> Self {
        QueuedPlcClient { store, requested_by }
    }

    async fn await_valve_op(&self, id: Uuid) -> PlcResult<()> {
        let deadline = tokio::time::Instant::now() + SERVICE_TIMEOUT;
        loop {
            if let Some(row) = self.store.get_valve_op(id).await? {
                if row.completed_at.is_some() {
                    return match row.error_message {
                        Some(msg) => Err(PlcError::transport(msg)),
                        None => Ok(()),
                    };
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PlcError::transport(
                    "timed out waiting for terminal 1 to service queued valve operation",
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn await_parameter_op(&self, id: Uuid) -> PlcResult<Option<f64>> {
        let deadline = tokio::time::Instant::now() + SERVICE_TIMEOUT;
        loop {
            if let Some(row) = self.store.get_parameter_op(id).await? {
                if row.completed_at.is_some() {
                    return match row.error_message {
                        Some(msg) => Err(PlcError::transport(msg)),
                        None => Ok(row.result_value),
                    };
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PlcError::transport(
                    "timed out waiting for terminal 1 to service queued parameter operation",
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl PlcClient for QueuedPlcClient {
    async fn write_coil(&self, address: u16, value: bool) -> PlcResult<()> {
        let id = Uuid::new_v4();
        self.store
            .submit_valve_op(ValveOpRow {
                id,
                coil_address: address,
                value,
                requested_by: self.requested_by.clone(),
                created_at: chrono::Utc::now(),
                claimed_at: None,
                completed_at: None,
                error_message: None,
            })
            .await?;
        self.await_valve_op(id).await
    }

    async fn write_value(&self, address: u16, value: RawValue) -> PlcResult<()> {
        if let RawValue::Bool(b) = value {
            return self.write_coil(address, b).await;
        }
        let id = Uuid::new_v4();
        self.store
            .submit_parameter_op(ParameterOpRow {
                id,
                address,
                data_type: data_type_of(value),
                kind: ParameterOpKind::Write,
                write_value: Some(value.as_f64()),
                requested_by: self.requested_by.clone(),
                created_at: chrono::Utc::now(),
                claimed_at: None,
                completed_at: None,
                result_value: None,
                error_message: None,
            })
            .await?;
        self.await_parameter_op(id).await.map(|_| ())
    }

    async fn read_value(&self, address: u16, ty: DataType) -> PlcResult<RawValue> {
        let id = Uuid::new_v4();
        self.store
            .submit_parameter_op(ParameterOpRow {
                id,
                address,
                data_type: ty,
                kind: ParameterOpKind::Read,
                write_value: None,
                requested_by: self.requested_by.clone(),
                created_at: chrono::Utc::now(),
                claimed_at: None,
                completed_at: None,
                result_value: None,
                error_message: None,
            })
            .await?;
        let value = self.await_parameter_op(id).await?.ok_or_else(|| {
            PlcError::protocol(format!("queued read at {address} completed with no result"))
        })?;
        Ok(RawValue::from_f64(ty, value))
    }
}

fn data_type_of(value: RawValue) -> DataType {
    match value {
        RawValue::U16(_) => DataType::U16,
        RawValue::I16(_) => DataType::I16,
        RawValue::U32(_) => DataType::U32,
        RawValue::I32(_) => DataType::I32,
        RawValue::F32(_) => DataType::F32,
        RawValue::Bool(_) => DataType::Bool,
    }
}

/// Runs only in Terminal 1: drains `valve_ops`/`parameter_ops` against
/// the one owned `PlcCommunicator` on behalf of Terminals 2 and 3.
/// Keeps servicing in-flight rows during an emergency so a T2/T3 valve
/// close still reaches the PLC; refusal of brand-new commands happens
/// upstream, in the command sources, not here.
pub struct PlcOperationDrain {
    communicator: Arc<PlcCommunicator>,
    store: Arc<dyn Store>,
}

impl PlcOperationDrain {
    pub fn new(communicator: Arc<PlcCommunicator>, store: Arc<dyn Store>) -> Self {
        PlcOperationDrain { communicator, store }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.drain_once().await {
                warn!("PLC operation drain cycle failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn drain_once(&self) -> PlcResult<()> {
        for row in self.store.poll_pending_valve_ops().await? {
            if !self.store.claim_valve_op(row.id).await? {
                continue;
            }
            let result = self.communicator.write_coil(row.coil_address, row.value).await;
            let error_message = result.as_ref().err().map(|e| e.to_string());
            self.store.complete_valve_op(row.id, error_message).await?;
            debug!("drained valve op {} (coil {})", row.id, row.coil_address);
        }

        for row in self.store.poll_pending_parameter_ops().await? {
            if !self.store.claim_parameter_op(row.id).await? {
                continue;
            }
            let (result_value, error_message) = match row.kind {
                ParameterOpKind::Read => match self.communicator.read_value(row.address, row.data_type).await {
                    Ok(value) => (Some(value.as_f64()), None),
                    Err(e) => (None, Some(e.to_string())),
                },
                ParameterOpKind::Write => match row.write_value {
                    None => (None, Some("write op submitted with no write_value".to_owned())),
                    Some(write_value) => {
                        let value = RawValue::from_f64(row.data_type, write_value);
                        match self.communicator.write_value(row.address, value).await {
                            Ok(()) => (None, None),
                            Err(e) => (None, Some(e.to_string())),
                        }
                    }
                },
            };
            self.store
                .complete_parameter_op(row.id, result_value, error_message)
                .await?;
            debug!("drained parameter op {} (address {})", row.id, row.address);
        }

        Ok(())
    }
}
