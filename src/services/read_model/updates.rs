//! Live Update Worker
//!
//! Consumes the ledger's infinite update stream and applies creates and
//! archives to the projection in offset order. The worker owns reconnection:
//! a closed or failed stream is re-opened after a fixed back-off from the
//! last persisted offset, with a fresh access token; in-memory state is
//! never discarded. A periodic reconnect pre-empts token expiry.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use futures::StreamExt;

use super::ReadModel;
use crate::ledger::TemplateId;

impl ReadModel {
    /// Run the live-update consumer until shutdown. Expects `bootstrap` to
    /// have populated `last_offset`; without one (degraded mode) the worker
    /// keeps trying to obtain a fresh ledger end so streaming can recover.
    pub async fn run_live_updates(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Live update worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let offset = match self.last_offset() {
                Some(offset) => offset,
                None => match self.ledger.get_ledger_end().await {
                    Ok(offset) => offset,
                    Err(e) => {
                        warn!("Cannot obtain ledger end for update stream: {}", e);
                        if wait_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let stream = match self
                .ledger
                .stream_updates(&offset, &TemplateId::ALL)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot open update stream at {}: {}", offset, e);
                    crate::metrics::record_read_model_reconnect();
                    if wait_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            debug!("Update stream open at offset {}", offset);
            let refresh_deadline = tokio::time::sleep(self.config.token_refresh_interval);
            tokio::pin!(refresh_deadline);
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("Live update worker stopping");
                        return;
                    }
                    // Reconnect with a fresh token before the current one
                    // can expire mid-stream
                    _ = &mut refresh_deadline => {
                        debug!("Scheduled token-refresh reconnect");
                        crate::metrics::record_read_model_reconnect();
                        break;
                    }
                    item = stream.next() => {
                        match item {
                            Some(Ok(update)) => self.apply_update(update),
                            Some(Err(e)) => {
                                warn!("Update stream error: {}", e);
                                crate::metrics::record_read_model_reconnect();
                                break;
                            }
                            None => {
                                warn!("Update stream closed by the ledger");
                                crate::metrics::record_read_model_reconnect();
                                break;
                            }
                        }
                    }
                }
            }

            // The stream (and its underlying transport) is dropped here;
            // back off before resubscribing from the persisted offset
            if wait_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                break;
            }
        }
        info!("Live update worker stopped");
    }
}

/// Sleep for `delay`, returning true when shutdown fired first
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: std::time::Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        ActiveContract, LedgerApi, LedgerCommand, LedgerError, LedgerUpdate, Offset,
        TransactionResult,
    };
    use crate::services::read_model::ReadModelConfig;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::time::Duration;

    struct ScriptedLedger {
        updates: parking_lot::Mutex<Vec<LedgerUpdate>>,
    }

    #[async_trait]
    impl LedgerApi for ScriptedLedger {
        async fn submit_command(
            &self,
            _act_as: &[String],
            _read_as: &[String],
            _command: LedgerCommand,
        ) -> Result<TransactionResult, LedgerError> {
            unimplemented!("not used")
        }

        async fn query_active(
            &self,
            _party: &str,
            _templates: &[TemplateId],
            _page_size: usize,
        ) -> Result<Vec<ActiveContract>, LedgerError> {
            Ok(Vec::new())
        }

        async fn stream_active_at_offset(
            &self,
            _offset: &Offset,
            _templates: &[TemplateId],
        ) -> Result<BoxStream<'static, Result<ActiveContract, LedgerError>>, LedgerError> {
            Ok(futures::stream::empty().boxed())
        }

        async fn stream_updates(
            &self,
            _from_offset: &Offset,
            _templates: &[TemplateId],
        ) -> Result<BoxStream<'static, Result<LedgerUpdate, LedgerError>>, LedgerError> {
            let updates = std::mem::take(&mut *self.updates.lock());
            Ok(futures::stream::iter(updates.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed())
        }

        async fn execute_allocation(
            &self,
            _allocation_ref: &str,
            _executor: &str,
            _owner_hint: &str,
        ) -> Result<TransactionResult, LedgerError> {
            unimplemented!("not used")
        }

        async fn withdraw_allocation(
            &self,
            _allocation_ref: &str,
            _owner: &str,
        ) -> Result<TransactionResult, LedgerError> {
            unimplemented!("not used")
        }

        async fn get_ledger_end(&self) -> Result<Offset, LedgerError> {
            Ok(Offset("0000".into()))
        }

        async fn get_available_balance(
            &self,
            _party: &str,
            _asset: &str,
        ) -> Result<Decimal, LedgerError> {
            Ok(Decimal::ZERO)
        }
    }

    fn order_contract(cid: &str) -> ActiveContract {
        ActiveContract {
            contract_id: cid.to_string(),
            template_id: TemplateId::Order,
            payload: json!({
                "orderId": uuid::Uuid::new_v4().to_string(),
                "owner": "party::a",
                "tradingPair": "CC/CBTC",
                "side": "Buy",
                "mode": "Limit",
                "price": "100",
                "quantity": "1",
                "filled": "0",
                "status": "Open",
                "placedAt": "2024-05-01T10:00:00Z",
            }),
        }
    }

    #[tokio::test]
    async fn test_live_updates_apply_in_offset_order() {
        let ledger = Arc::new(ScriptedLedger {
            updates: parking_lot::Mutex::new(vec![
                LedgerUpdate::Created {
                    contract: order_contract("#1:0"),
                    offset: Offset("0001".into()),
                },
                LedgerUpdate::Archived {
                    contract_id: "#1:0".into(),
                    template_id: TemplateId::Order,
                    offset: Offset("0002".into()),
                },
                LedgerUpdate::Created {
                    contract: order_contract("#2:0"),
                    offset: Offset("0003".into()),
                },
            ]),
        });

        let model = Arc::new(ReadModel::new(
            ledger,
            "party::operator".into(),
            ReadModelConfig {
                reconnect_delay: Duration::from_millis(5),
                ..Default::default()
            },
        ));
        model.bootstrap().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&model).run_live_updates(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(model.order_by_contract_id("#1:0").is_none());
        assert!(model.order_by_contract_id("#2:0").is_some());
        assert_eq!(model.last_offset().unwrap().as_str(), "0003");

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
    }
}
