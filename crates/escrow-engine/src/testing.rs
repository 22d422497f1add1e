use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bet_domain::{Amount, Bet, BetId, BetStatus, PayeeId};
use bet_store::{BetRepository, InMemoryBetRepository, InMemorySettlementEventRepository};
use payment_gateway::{
    ChargeRef, GatewayError, HoldRef, OpenHoldRequest, PaymentGateway, PaymentState, RefundRef,
    RefundRequest, ReleaseRef, TransferRef, TransferRequest,
};

use crate::fee::FeePolicy;
use crate::service::EscrowService;

/// Programmable gateway double. Scripted responses are consumed front to
/// back; once the script runs out, calls fall back to deterministic successes.
pub struct MockGateway {
    pub calls: Mutex<Vec<String>>,
    pub payment_state: Mutex<PaymentState>,
    pub capture_script: Mutex<VecDeque<Result<ChargeRef, GatewayError>>>,
    pub transfer_script: Mutex<VecDeque<Result<TransferRef, GatewayError>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            payment_state: Mutex::new(PaymentState::RequiresCapture),
            capture_script: Mutex::new(VecDeque::new()),
            transfer_script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_payment_state(&self, state: PaymentState) {
        *self.payment_state.lock().unwrap() = state;
    }

    pub fn script_capture(&self, response: Result<ChargeRef, GatewayError>) {
        self.capture_script.lock().unwrap().push_back(response);
    }

    pub fn script_transfer(&self, response: Result<TransferRef, GatewayError>) {
        self.transfer_script.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn open_hold(&self, request: &OpenHoldRequest) -> Result<HoldRef, GatewayError> {
        self.record("open_hold");
        Ok(HoldRef(format!("hold_{}", request.bet_id)))
    }

    async fn capture_hold(&self, hold_ref: &HoldRef) -> Result<ChargeRef, GatewayError> {
        self.record("capture_hold");
        let scripted = self.capture_script.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| Ok(ChargeRef(format!("ch_{hold_ref}"))));
        if let Ok(charge) = &result {
            *self.payment_state.lock().unwrap() = PaymentState::Captured {
                charge_ref: charge.clone(),
            };
        }
        result
    }

    async fn cancel_hold(&self, hold_ref: &HoldRef) -> Result<ReleaseRef, GatewayError> {
        self.record("cancel_hold");
        *self.payment_state.lock().unwrap() = PaymentState::Canceled;
        Ok(ReleaseRef(format!("re_{hold_ref}")))
    }

    async fn refund_charge(&self, request: &RefundRequest) -> Result<RefundRef, GatewayError> {
        self.record("refund_charge");
        Ok(RefundRef(format!("rf_{}", request.charge_ref)))
    }

    async fn transfer_from_charge(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferRef, GatewayError> {
        self.record("transfer_from_charge");
        let scripted = self.transfer_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(TransferRef(format!("tr_{}", request.bet_id))))
    }

    async fn get_payment_state(&self, _hold_ref: &HoldRef) -> Result<PaymentState, GatewayError> {
        self.record("get_payment_state");
        Ok(self.payment_state.lock().unwrap().clone())
    }
}

pub struct Harness {
    pub bets: Arc<InMemoryBetRepository>,
    pub events: Arc<InMemorySettlementEventRepository>,
    pub gateway: Arc<MockGateway>,
    pub service:
        Arc<EscrowService<InMemoryBetRepository, InMemorySettlementEventRepository, MockGateway>>,
}

pub fn harness() -> Harness {
    let bets = Arc::new(InMemoryBetRepository::new());
    let events = Arc::new(InMemorySettlementEventRepository::new());
    let gateway = Arc::new(MockGateway::new());
    let service = Arc::new(EscrowService::new(
        Arc::clone(&bets),
        Arc::clone(&events),
        Arc::clone(&gateway),
        FeePolicy::twenty_percent(),
    ));
    Harness {
        bets,
        events,
        gateway,
        service,
    }
}

/// Inserts a bet that has completed checkout: Active, hold in place, payee
/// configured.
pub async fn seed_active_bet(harness: &Harness, stake: Amount) -> BetId {
    let bet_id = BetId::new();
    let mut bet = Bet::new(bet_id, stake).with_payee(PayeeId::new(), "acct_anti_charity");
    bet.status = BetStatus::Active;
    bet.hold_ref = Some(format!("hold_{bet_id}"));
    harness.bets.insert_bet(&bet).await.expect("seed bet");
    bet_id
}

/// Same, but still awaiting checkout confirmation.
pub async fn seed_pending_bet(harness: &Harness, stake: Amount) -> BetId {
    let bet_id = BetId::new();
    let mut bet = Bet::new(bet_id, stake).with_payee(PayeeId::new(), "acct_anti_charity");
    bet.status = BetStatus::Pending;
    bet.hold_ref = Some(format!("hold_{bet_id}"));
    harness.bets.insert_bet(&bet).await.expect("seed bet");
    bet_id
}
