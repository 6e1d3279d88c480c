//! PLC Communicator (spec §4.B): typed Modbus operations over a single
//! owned transport, with retry/backoff and broken-pipe-aware reconnect.
//!
//! Grounded on `communicator.py`'s `_execute_with_retry` harness (retry
//! count, exponential backoff, broken-pipe reclassification-as-retryable)
//! and the teacher's `Comm` trait for the transport seam. Wire encoding
//! uses `rmodbus`'s client request/response builders; multi-register
//! values go through `crate::codec` for the byte-order conversion the
//! original hand-rolled with `struct.pack`/`struct.unpack`.

pub mod discovery;
pub mod queue;
pub mod transport;

use crate::codec::{DataType, RawValue};
use crate::config::ByteOrder;
use crate::error::{PlcError, PlcResult};
use log::{debug, info, warn};
use rmodbus::client::ModbusRequest;
use rmodbus::ModbusProto;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use transport::Transport;

const OPERATION_RETRIES: u32 = 3;
const OPERATION_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const HEALTH_CHECK_THROTTLE: Duration = Duration::from_secs(1);

pub struct PlcCommunicator {
    transport: Arc<dyn Transport>,
    slave_id: u8,
    byte_order: ByteOrder,
    last_health_check: Mutex<Option<tokio::time::Instant>>,
}

impl PlcCommunicator {
    pub fn new(transport: Arc<dyn Transport>, slave_id: u8, byte_order: ByteOrder) -> Self {
        PlcCommunicator {
            transport,
            slave_id,
            byte_order,
            last_health_check: Mutex::new(None),
        }
    }

    /// Throttled health probe: reads a single coil and treats any
    /// well-formed Modbus response (even an exception reply) as evidence
    /// the link is alive. Skips the probe if one ran in the last second.
    pub async fn is_healthy(&self) -> bool {
        {
            let mut last = self.last_health_check.lock().await;
            if let Some(t) = *last {
                if t.elapsed() < HEALTH_CHECK_THROTTLE {
                    return true;
                }
            }
            *last = Some(tokio::time::Instant::now());
        }
        self.read_coils_raw(0, 1).await.is_ok()
    }

    /// Runs one attempt's outcome through the shared retry/backoff policy.
    /// Returns `Some(result)` once the caller should stop retrying (either
    /// success or attempts exhausted), `None` if it should try again after
    /// the already-applied backoff/reconnect.
    async fn after_attempt<T>(
        &self,
        operation_name: &str,
        attempt: u32,
        outcome: PlcResult<T>,
    ) -> Result<Option<T>, PlcError> {
        match outcome {
            Ok(v) => {
                if attempt > 1 {
                    info!("{operation_name} succeeded on attempt {attempt}");
                }
                Ok(Some(v))
            }
            Err(e) => {
                let is_broken_pipe =
                    matches!(&e, PlcError::Transport(m) if PlcError::is_broken_pipe_family(m));
                if is_broken_pipe {
                    warn!(
                        "{operation_name} failed with broken pipe error (attempt {attempt}/{OPERATION_RETRIES}): {e}"
                    );
                    self.transport.reconnect().await;
                } else {
                    warn!("{operation_name} failed (attempt {attempt}/{OPERATION_RETRIES}): {e}");
                }
                if attempt >= OPERATION_RETRIES {
                    return Err(e);
                }
                let delay = OPERATION_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
                Ok(None)
            }
        }
    }

    async fn roundtrip(&self, request: Vec<u8>, expected_response_min: usize) -> PlcResult<Vec<u8>> {
        self.transport.write(&request).await?;
        let mut header = [0u8; 6];
        self.transport.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut body = vec![0u8; len.max(expected_response_min)];
        self.transport.read_exact(&mut body[..len]).await?;
        let mut response = Vec::with_capacity(header.len() + len);
        response.extend_from_slice(&header);
        response.extend_from_slice(&body[..len]);
        Ok(response)
    }

    pub async fn read_holding_registers(&self, address: u16, count: u16) -> PlcResult<Vec<u16>> {
        let operation_name = format!("read_holding_registers(address={address}, count={count})");
        for attempt in 1..=OPERATION_RETRIES {
            let outcome: PlcResult<Vec<u16>> = async {
                let mut mreq = ModbusRequest::new(self.slave_id, ModbusProto::TcpUdp);
                let mut request = Vec::new();
                mreq.generate_get_holdings(address, count, &mut request)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                let response = self.roundtrip(request, usize::from(count) * 2 + 2).await?;
                let mut data = Vec::new();
                mreq.parse_u16(&response, &mut data)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                debug!("raw registers at {address}: {data:?}");
                Ok(data)
            }
            .await;
            if let Some(result) = self.after_attempt(&operation_name, attempt, outcome).await? {
                return Ok(result);
            }
        }
        unreachable!("after_attempt returns Err before exhausting retries")
    }

    async fn read_coils_raw(&self, address: u16, count: u16) -> PlcResult<Vec<bool>> {
        let operation_name = format!("read_coils(address={address}, count={count})");
        for attempt in 1..=OPERATION_RETRIES {
            let outcome: PlcResult<Vec<bool>> = async {
                let mut mreq = ModbusRequest::new(self.slave_id, ModbusProto::TcpUdp);
                let mut request = Vec::new();
                mreq.generate_get_coils(address, count, &mut request)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                let response = self.roundtrip(request, 3).await?;
                let mut data = Vec::new();
                mreq.parse_bool(&response, &mut data)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                Ok(data)
            }
            .await;
            if let Some(result) = self.after_attempt(&operation_name, attempt, outcome).await? {
                return Ok(result);
            }
        }
        unreachable!("after_attempt returns Err before exhausting retries")
    }

    pub async fn read_coils(&self, address: u16, count: u16) -> PlcResult<Vec<bool>> {
        let bits = self.read_coils_raw(address, count).await?;
        for (i, bit) in bits.iter().take(count as usize).enumerate() {
            debug!("coil {}: {}", address + i as u16, if *bit { "ON" } else { "OFF" });
        }
        Ok(bits)
    }

    pub async fn write_coil(&self, address: u16, value: bool) -> PlcResult<()> {
        let operation_name = format!("write_coil(address={address}, value={value})");
        for attempt in 1..=OPERATION_RETRIES {
            let outcome: PlcResult<()> = async {
                let mut mreq = ModbusRequest::new(self.slave_id, ModbusProto::TcpUdp);
                let mut request = Vec::new();
                mreq.generate_set_coil(address, value, &mut request)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                let response = self.roundtrip(request, 4).await?;
                mreq.parse_ok(&response)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                Ok(())
            }
            .await;
            if let Some(result) = self.after_attempt(&operation_name, attempt, outcome).await? {
                return Ok(result);
            }
        }
        unreachable!("after_attempt returns Err before exhausting retries")
    }

    pub async fn write_register(&self, address: u16, value: u16) -> PlcResult<()> {
        let operation_name = format!("write_register(address={address}, value={value})");
        for attempt in 1..=OPERATION_RETRIES {
            let outcome: PlcResult<()> = async {
                let mut mreq = ModbusRequest::new(self.slave_id, ModbusProto::TcpUdp);
                let mut request = Vec::new();
                mreq.generate_set_holding(address, value, &mut request)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                let response = self.roundtrip(request, 4).await?;
                mreq.parse_ok(&response)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                Ok(())
            }
            .await;
            if let Some(result) = self.after_attempt(&operation_name, attempt, outcome).await? {
                return Ok(result);
            }
        }
        unreachable!("after_attempt returns Err before exhausting retries")
    }

    pub async fn write_registers(&self, address: u16, values: &[u16]) -> PlcResult<()> {
        let operation_name = format!("write_registers(address={address}, count={})", values.len());
        for attempt in 1..=OPERATION_RETRIES {
            let outcome: PlcResult<()> = async {
                let mut mreq = ModbusRequest::new(self.slave_id, ModbusProto::TcpUdp);
                let mut request = Vec::new();
                mreq.generate_set_holdings_bulk(address, values, &mut request)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                let response = self.roundtrip(request, 4).await?;
                mreq.parse_ok(&response)
                    .map_err(|e| PlcError::protocol(format!("{e:?}")))?;
                Ok(())
            }
            .await;
            if let Some(result) = self.after_attempt(&operation_name, attempt, outcome).await? {
                return Ok(result);
            }
        }
        unreachable!("after_attempt returns Err before exhausting retries")
    }

    /// Reads and decodes a single parameter's raw value given its data
    /// type and starting address (spec §4.C/§4.G).
    pub async fn read_value(&self, address: u16, ty: DataType) -> PlcResult<RawValue> {
        if ty == DataType::Bool {
            let bits = self.read_coils(address, 1).await?;
            return Ok(RawValue::Bool(*bits.first().unwrap_or(&false)));
        }
        let count = ty.register_width() as u16;
        let regs = self.read_holding_registers(address, count).await?;
        RawValue::decode(ty, &regs, self.byte_order)
            .ok_or_else(|| PlcError::protocol(format!("short register read at {address}")))
    }

    pub async fn write_value(&self, address: u16, value: RawValue) -> PlcResult<()> {
        match value {
            RawValue::Bool(b) => self.write_coil(address, b).await,
            other => {
                let regs = other.encode(self.byte_order);
                if regs.len() == 1 {
                    self.write_register(address, regs[0]).await
                } else {
                    self.write_registers(address, &regs).await
                }
            }
        }
    }

    /// Bulk read across however many parameters the registry asks for,
    /// coalescing contiguous holding-register addresses into one
    /// `read_holding_registers` span per run instead of one round-trip
    /// per parameter (spec T2 throughput target). Coils live in a
    /// separate address space and are always read individually.
    pub async fn read_all(&self, requests: &[(u16, DataType)]) -> PlcResult<Vec<RawValue>> {
        let mut results: Vec<Option<RawValue>> = vec![None; requests.len()];
        let mut register_indices: Vec<usize> = Vec::new();
        for (i, &(address, ty)) in requests.iter().enumerate() {
            if ty == DataType::Bool {
                results[i] = Some(self.read_value(address, ty).await?);
            } else {
                register_indices.push(i);
            }
        }

        register_indices.sort_by_key(|&i| requests[i].0);
        let mut spans: Vec<(u16, u16, Vec<usize>)> = Vec::new();
        for i in register_indices {
            let (address, ty) = requests[i];
            let width = ty.register_width() as u16;
            let extends_last = spans
                .last()
                .is_some_and(|(start, len, _)| start + *len == address);
            if extends_last {
                let last = spans.last_mut().expect("just checked Some");
                last.1 += width;
                last.2.push(i);
            } else {
                spans.push((address, width, vec![i]));
            }
        }

        for (start, len, indices) in spans {
            let regs = self.read_holding_registers(start, len).await?;
            for i in indices {
                let (address, ty) = requests[i];
                let offset = (address - start) as usize;
                let width = ty.register_width();
                let slice = regs.get(offset..offset + width).ok_or_else(|| {
                    PlcError::protocol(format!("short register read at {address}"))
                })?;
                let value = RawValue::decode(ty, slice, self.byte_order)
                    .ok_or_else(|| PlcError::protocol(format!("short register read at {address}")))?;
                results[i] = Some(value);
            }
        }

        Ok(results
            .into_iter()
            .map(|v| v.expect("every request index is filled by either branch above"))
            .collect())
    }
}

/// Seam between a component that needs PLC access and how it actually
/// reaches the physical link. Terminal 1 implements this directly over
/// its own socket; Terminals 2 and 3 implement it by queuing the
/// operation through the store for Terminal 1 to service, since §4.I
/// forbids them opening a second Modbus socket.
#[async_trait::async_trait]
pub trait PlcClient: Send + Sync {
    async fn write_coil(&self, address: u16, value: bool) -> PlcResult<()>;
    async fn write_value(&self, address: u16, value: RawValue) -> PlcResult<()>;
    async fn read_value(&self, address: u16, ty: DataType) -> PlcResult<RawValue>;
}

#[async_trait::async_trait]
impl PlcClient for PlcCommunicator {
    async fn write_coil(&self, address: u16, value: bool) -> PlcResult<()> {
        PlcCommunicator::write_coil(self, address, value).await
    }

    async fn write_value(&self, address: u16, value: RawValue) -> PlcResult<()> {
        PlcCommunicator::write_value(self, address, value).await
    }

    async fn read_value(&self, address: u16, ty: DataType) -> PlcResult<RawValue> {
        PlcCommunicator::read_value(self, address, ty).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyTransport {
        fail_times: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for FlakyTransport {
        async fn write(&self, _buf: &[u8]) -> PlcResult<()> {
            Ok(())
        }
        async fn read_exact(&self, _buf: &mut [u8]) -> PlcResult<()> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(PlcError::transport("broken pipe"))
            } else {
                Err(PlcError::protocol("stub read always fails in this test"))
            }
        }
        async fn reconnect(&self) {}
    }

    #[tokio::test]
    async fn retries_and_reconnects_on_broken_pipe() {
        let transport = Arc::new(FlakyTransport {
            fail_times: AtomicUsize::new(1),
        });
        let comm = PlcCommunicator::new(transport, 1, ByteOrder::Badc);
        let result = comm.read_holding_registers(0, 2).await;
        assert!(result.is_err());
    }
}
