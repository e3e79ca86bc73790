// ===============================
// src/risk.rs (cash-out + emergency stop)
// ===============================
//
// Runs after every fill-and-mark step for an account:
// - cash-out : ROI reached the lock-in threshold -> liquidate at mark,
//              bank the profit into `cashed_out`, reset the working account
//              to starting cash so the agent restarts from a clean slate
// - emergency stop : ROI fell through the loss floor -> liquidate at mark,
//              clear entries, leave whatever equity remains
//
// Liquidation happens at the snapshot mark with no fee or slippage; both
// paths are total (every open position is closed). Returns the event to
// publish, or None when neither threshold tripped.
//

use tracing::{info, warn};

use crate::config::SimParams;
use crate::domain::{Account, Event, Snapshot};
use crate::metrics::{CASHOUTS, EMERGENCY_STOPS};

pub struct RiskController {
    params: SimParams,
}

impl RiskController {
    pub fn new(params: SimParams) -> Self {
        Self { params }
    }

    fn liquidate(account: &mut Account, snap: &Snapshot) {
        for (sym, qty) in account.holdings.iter_mut() {
            if *qty != 0.0 {
                account.cash += *qty * snap.price(sym);
                *qty = 0.0;
            }
        }
        account.entry_prices.clear();
    }

    pub fn apply(&self, account: &mut Account, snap: &Snapshot) -> Option<Event> {
        let equity = account.mark_equity(snap);
        let roi = (equity - self.params.starting_cash) / self.params.starting_cash * 100.0;
        account.equity = equity;
        account.roi = roi;

        if roi >= self.params.cashout_threshold_pct {
            let profit = equity - self.params.starting_cash;
            Self::liquidate(account, snap);
            account.cashed_out += profit;
            account.cash = self.params.starting_cash;
            account.equity = self.params.starting_cash;
            account.roi = 0.0;

            CASHOUTS.with_label_values(&[&account.name]).inc();
            info!(
                agent = %account.name,
                profit = format!("{profit:.4}"),
                total = format!("{:.4}", account.cashed_out),
                "risk: cash-out, profit banked"
            );
            return Some(Event::AgentCashout {
                agent: account.name.clone(),
                profit,
                total_cashed_out: account.cashed_out,
                timestamp: snap.timestamp_ms,
            });
        }

        if roi <= self.params.emergency_stop_pct {
            // reported as a positive magnitude
            let loss = self.params.starting_cash - equity;
            Self::liquidate(account, snap);
            account.equity = account.cash;
            account.roi =
                (account.equity - self.params.starting_cash) / self.params.starting_cash * 100.0;

            EMERGENCY_STOPS.with_label_values(&[&account.name]).inc();
            warn!(
                agent = %account.name,
                loss = format!("{loss:.4}"),
                final_equity = format!("{:.4}", account.equity),
                "risk: emergency stop, positions flattened"
            );
            return Some(Event::EmergencyStop {
                agent: account.name.clone(),
                loss,
                final_equity: account.equity,
                timestamp: snap.timestamp_ms,
            });
        }

        None
    }
}
