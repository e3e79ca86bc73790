// ===============================
// src/ledger.rs (order execution engine)
// ===============================
//
// Converts a validated TradeIntent into a fill against one account:
// - adverse slippage drawn uniformly from [slippage_min, slippage_max]
// - proportional fee on notional
// - leverage gate per side (long notional and short notional each bounded by
//   equity * max_leverage), with an exemption for the reducing part of an
//   order: covering an opposite position is always permitted up to the open
//   position size, only the net-new part must pass the gate
// - entry prices: open records the fill, adding recomputes a notional-
//   weighted average, full close clears, a flip clears then records anew
//
// Rejections are silent no-ops from the agent's perspective; the reason is
// surfaced to the caller for logging/metrics only.
//

use rand::Rng;
use thiserror::Error;

use crate::config::SimParams;
use crate::domain::{Account, Action, FillResult, Snapshot, TradeIntent, TradeRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Reject {
    #[error("nothing to execute")]
    Empty,
    #[error("no tradable price for symbol")]
    BadPrice,
    #[error("order notional exceeds remaining buying power")]
    Leverage,
    #[error("insufficient cash")]
    InsufficientCash,
}

pub struct Ledger {
    params: SimParams,
}

impl Ledger {
    pub fn new(params: SimParams) -> Self {
        Self { params }
    }

    fn draw_slippage(&self) -> f64 {
        let (lo, hi) = (self.params.slippage_min, self.params.slippage_max);
        if hi <= lo {
            lo
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        }
    }

    fn long_notional(account: &Account, snap: &Snapshot) -> f64 {
        account
            .holdings
            .iter()
            .filter(|(_, q)| **q > 0.0)
            .map(|(s, q)| q * snap.price(s))
            .sum()
    }

    fn short_notional(account: &Account, snap: &Snapshot) -> f64 {
        account
            .holdings
            .iter()
            .filter(|(_, q)| **q < 0.0)
            .map(|(s, q)| q.abs() * snap.price(s))
            .sum()
    }

    fn record(&self, account: &mut Account, action: Action, symbol: &str, quantity: f64, price: f64, fee: f64, ts: i64) {
        account.trade_history.push(TradeRecord {
            action,
            symbol: symbol.to_string(),
            quantity,
            price,
            fee,
            timestamp_ms: ts,
        });
        let cap = self.params.trade_history_cap;
        if account.trade_history.len() > cap {
            let excess = account.trade_history.len() - cap;
            account.trade_history.drain(..excess);
        }
        account.trades_count += 1;
        account.total_fees += fee;
    }

    pub fn execute(
        &self,
        account: &mut Account,
        intent: &TradeIntent,
        snap: &Snapshot,
    ) -> Result<FillResult, Reject> {
        let symbol = match (&intent.action, &intent.symbol) {
            (Action::Hold, _) | (_, None) => return Err(Reject::Empty),
            (_, Some(s)) => s.as_str(),
        };
        let quantity = intent.quantity;
        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(Reject::Empty);
        }
        let mark = snap.price(symbol);
        if mark <= 0.0 {
            return Err(Reject::BadPrice);
        }

        // Adverse slippage: buys pay up, sells receive less.
        let slip = self.draw_slippage();
        let price = match intent.action {
            Action::Buy => mark * (1.0 + slip),
            Action::Sell => mark * (1.0 - slip),
            Action::Hold => unreachable!(),
        };

        let equity = account.mark_equity(snap);
        let curr_qty = account.holdings.get(symbol).copied().unwrap_or(0.0);
        let ts = snap.timestamp_ms;

        match intent.action {
            Action::Buy => {
                let cost = quantity * price;
                let fee = cost * self.params.fee_rate;
                let total_req = cost + fee;

                // Net-new long exposure: everything past covering the short.
                let cover_qty = if curr_qty < 0.0 { quantity.min(-curr_qty) } else { 0.0 };
                let open_qty = quantity - cover_qty;

                if open_qty > 0.0 {
                    let buying_power =
                        equity * self.params.max_leverage - Self::long_notional(account, snap);
                    if open_qty * price > buying_power {
                        return Err(Reject::Leverage);
                    }
                    if account.cash < total_req {
                        return Err(Reject::InsufficientCash);
                    }
                } else if account.cash < total_req {
                    // Pure cover is exempt from the leverage gate but still
                    // needs the cash to pay for it.
                    return Err(Reject::InsufficientCash);
                }

                // Win bookkeeping: a covering buy below the short entry.
                if curr_qty < 0.0 {
                    if let Some(entry) = account.entry_prices.get(symbol) {
                        if *entry > 0.0 && price < *entry {
                            account.wins += 1;
                        }
                    }
                }

                let new_qty = curr_qty + quantity;
                if curr_qty < 0.0 {
                    if new_qty >= 0.0 {
                        account.entry_prices.remove(symbol);
                        if new_qty > 0.0 {
                            // flipped past flat into a long
                            account.entry_prices.insert(symbol.to_string(), price);
                        }
                    }
                    // still short: keep the short entry
                } else {
                    let prev_entry = account.entry_prices.get(symbol).copied().unwrap_or(0.0);
                    if curr_qty > 0.0 && prev_entry > 0.0 {
                        let avg = (curr_qty * prev_entry + quantity * price) / new_qty;
                        account.entry_prices.insert(symbol.to_string(), avg);
                    } else {
                        account.entry_prices.insert(symbol.to_string(), price);
                    }
                }

                account.cash -= total_req;
                account.holdings.insert(symbol.to_string(), new_qty);
                self.record(account, Action::Buy, symbol, quantity, price, fee, ts);

                Ok(FillResult { filled_price: price, fee, quantity, new_position: new_qty })
            }
            Action::Sell => {
                let revenue = quantity * price;
                let fee = revenue * self.params.fee_rate;
                let proceeds = revenue - fee;

                let close_qty = if curr_qty > 0.0 { quantity.min(curr_qty) } else { 0.0 };
                let open_qty = quantity - close_qty;

                if open_qty > 0.0 {
                    let shorting_power =
                        equity * self.params.max_leverage - Self::short_notional(account, snap);
                    if open_qty * price > shorting_power {
                        return Err(Reject::Leverage);
                    }
                }

                // Win bookkeeping: a closing sell above the long entry.
                if curr_qty > 0.0 {
                    if let Some(entry) = account.entry_prices.get(symbol) {
                        if *entry > 0.0 && price > *entry {
                            account.wins += 1;
                        }
                    }
                }

                let new_qty = curr_qty - quantity;
                if curr_qty > 0.0 {
                    if new_qty <= 0.0 {
                        account.entry_prices.remove(symbol);
                        if new_qty < 0.0 {
                            // flipped past flat into a short
                            account.entry_prices.insert(symbol.to_string(), price);
                        }
                    }
                    // partial close keeps the long entry
                } else if curr_qty == 0.0 {
                    account.entry_prices.insert(symbol.to_string(), price);
                } else {
                    // adding to a short: notional-weighted average entry
                    let prev_entry = account.entry_prices.get(symbol).copied().unwrap_or(0.0);
                    if prev_entry > 0.0 {
                        let avg =
                            (curr_qty.abs() * prev_entry + quantity * price) / new_qty.abs();
                        account.entry_prices.insert(symbol.to_string(), avg);
                    } else {
                        account.entry_prices.insert(symbol.to_string(), price);
                    }
                }

                account.cash += proceeds;
                account.holdings.insert(symbol.to_string(), new_qty);
                self.record(account, Action::Sell, symbol, quantity, price, fee, ts);

                Ok(FillResult { filled_price: price, fee, quantity, new_position: new_qty })
            }
            Action::Hold => Err(Reject::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Signals, Tick};

    fn params_no_slip() -> SimParams {
        SimParams { slippage_min: 0.0, slippage_max: 0.0, ..SimParams::default() }
    }

    fn snap(prices: &[(&str, f64)]) -> Snapshot {
        let mut s = Snapshot { timestamp_ms: 1_000, ticks: Default::default() };
        for (sym, px) in prices {
            s.ticks.insert(
                sym.to_string(),
                Tick {
                    symbol: sym.to_string(),
                    price: *px,
                    volume: 0.0,
                    bid: *px,
                    ask: *px,
                    bids: vec![],
                    asks: vec![],
                    signals: Signals::default(),
                    timestamp_ms: 1_000,
                },
            );
        }
        s
    }

    fn buy(sym: &str, qty: f64) -> TradeIntent {
        TradeIntent { action: Action::Buy, symbol: Some(sym.into()), quantity: qty }
    }

    fn sell(sym: &str, qty: f64) -> TradeIntent {
        TradeIntent { action: Action::Sell, symbol: Some(sym.into()), quantity: qty }
    }

    fn symbols() -> Vec<String> {
        vec!["BTC".into()]
    }

    #[test]
    fn buy_requires_cash_including_fee() {
        // cash 100, price 100, fee 0.075% -> 100.075 required -> reject
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 100.0, &symbols());
        let s = snap(&[("BTC", 100.0)]);

        let res = ledger.execute(&mut acct, &buy("BTC", 1.0), &s);
        assert_eq!(res.unwrap_err(), Reject::InsufficientCash);
        assert_eq!(acct.cash, 100.0);
        assert_eq!(acct.holdings["BTC"], 0.0);
        assert_eq!(acct.trades_count, 0);
    }

    #[test]
    fn buy_fill_updates_cash_holdings_and_entry() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 100.0, &symbols());
        let s = snap(&[("BTC", 50.0)]);

        let fill = ledger.execute(&mut acct, &buy("BTC", 1.0), &s).unwrap();
        assert!((fill.filled_price - 50.0).abs() < 1e-12);
        assert!((fill.fee - 50.0 * 0.00075).abs() < 1e-12);
        assert!((acct.cash - (100.0 - 50.0 - fill.fee)).abs() < 1e-12);
        assert_eq!(acct.holdings["BTC"], 1.0);
        assert_eq!(acct.entry_prices["BTC"], 50.0);
        assert_eq!(acct.trade_history.len(), 1);

        // equity identity after the step
        let equity = acct.mark_equity(&s);
        assert!((equity - (acct.cash + 1.0 * 50.0)).abs() < 1e-9);
    }

    #[test]
    fn adding_to_long_recomputes_weighted_entry() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 1_000.0, &symbols());

        ledger.execute(&mut acct, &buy("BTC", 2.0), &snap(&[("BTC", 100.0)])).unwrap();
        ledger.execute(&mut acct, &buy("BTC", 2.0), &snap(&[("BTC", 110.0)])).unwrap();

        assert_eq!(acct.holdings["BTC"], 4.0);
        assert!((acct.entry_prices["BTC"] - 105.0).abs() < 1e-9);
    }

    #[test]
    fn full_close_clears_entry_and_counts_win() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 1_000.0, &symbols());

        ledger.execute(&mut acct, &buy("BTC", 2.0), &snap(&[("BTC", 100.0)])).unwrap();
        ledger.execute(&mut acct, &sell("BTC", 2.0), &snap(&[("BTC", 105.0)])).unwrap();

        assert_eq!(acct.holdings["BTC"], 0.0);
        assert!(!acct.entry_prices.contains_key("BTC"));
        assert_eq!(acct.wins, 1);
        assert_eq!(acct.trades_count, 2);
    }

    #[test]
    fn flip_clears_old_entry_and_records_new() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 10_000.0, &symbols());

        ledger.execute(&mut acct, &buy("BTC", 1.0), &snap(&[("BTC", 100.0)])).unwrap();
        // sell 3: closes the long and opens a 2-unit short at 120
        ledger.execute(&mut acct, &sell("BTC", 3.0), &snap(&[("BTC", 120.0)])).unwrap();

        assert_eq!(acct.holdings["BTC"], -2.0);
        assert_eq!(acct.entry_prices["BTC"], 120.0);
    }

    #[test]
    fn leverage_gate_rejects_oversized_long() {
        let ledger = Ledger::new(params_no_slip());
        let syms = vec!["BTC".to_string(), "ETH".to_string()];
        let mut acct = Account::new("a", 100.0, &syms);
        // Short proceeds leave plenty of cash while equity is small, so the
        // exposure gate is the binding limit rather than cash.
        acct.cash = 10_000.0;
        acct.holdings.insert("BTC".into(), -96.0);
        let s = snap(&[("BTC", 100.0), ("ETH", 100.0)]);

        // equity 400 * 4x = 1600 buying power -> 20 ETH @100 breaches
        let res = ledger.execute(&mut acct, &buy("ETH", 20.0), &s);
        assert_eq!(res.unwrap_err(), Reject::Leverage);
        assert_eq!(acct.holdings["ETH"], 0.0);

        // 15 ETH fits
        ledger.execute(&mut acct, &buy("ETH", 15.0), &s).unwrap();
    }

    #[test]
    fn leverage_gate_rejects_oversized_short() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 100.0, &symbols());
        let s = snap(&[("BTC", 100.0)]);

        // equity 100 * 4x = 400 shorting power -> 5 units @100 breaches
        assert_eq!(ledger.execute(&mut acct, &sell("BTC", 5.0), &s).unwrap_err(), Reject::Leverage);

        let fill = ledger.execute(&mut acct, &sell("BTC", 3.0), &s).unwrap();
        assert_eq!(fill.new_position, -3.0);
        assert_eq!(acct.entry_prices["BTC"], 100.0);
    }

    #[test]
    fn cover_is_exempt_from_leverage_gate() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 100.0, &symbols());

        ledger.execute(&mut acct, &sell("BTC", 3.0), &snap(&[("BTC", 100.0)])).unwrap();
        // Adverse move: equity collapses, any fresh exposure would breach,
        // but buying back the short must still be allowed.
        let worse = snap(&[("BTC", 120.0)]);
        let equity = acct.mark_equity(&worse);
        assert!(equity * 4.0 < 3.0 * 120.0);

        let fill = ledger.execute(&mut acct, &buy("BTC", 3.0), &worse).unwrap();
        assert_eq!(fill.new_position, 0.0);
        assert!(!acct.entry_prices.contains_key("BTC"));
    }

    #[test]
    fn covering_buy_below_short_entry_is_a_win() {
        let ledger = Ledger::new(params_no_slip());
        let mut acct = Account::new("a", 1_000.0, &symbols());

        ledger.execute(&mut acct, &sell("BTC", 2.0), &snap(&[("BTC", 100.0)])).unwrap();
        ledger.execute(&mut acct, &buy("BTC", 2.0), &snap(&[("BTC", 90.0)])).unwrap();
        assert_eq!(acct.wins, 1);
    }

    #[test]
    fn fee_is_monotonic_in_notional() {
        let ledger = Ledger::new(params_no_slip());
        let s = snap(&[("BTC", 100.0)]);

        let mut fees = Vec::new();
        for qty in [0.5, 1.0, 2.0, 4.0] {
            let mut acct = Account::new("a", 100_000.0, &symbols());
            let fill = ledger.execute(&mut acct, &buy("BTC", qty), &s).unwrap();
            fees.push(fill.fee);
        }
        assert!(fees.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn slippage_is_adverse_and_bounded() {
        let params = SimParams { slippage_min: 0.0001, slippage_max: 0.0005, ..SimParams::default() };
        let ledger = Ledger::new(params);
        let s = snap(&[("BTC", 100.0)]);

        for _ in 0..50 {
            let mut acct = Account::new("a", 100_000.0, &symbols());
            let fill = ledger.execute(&mut acct, &buy("BTC", 1.0), &s).unwrap();
            assert!(fill.filled_price >= 100.0 * 1.0001 - 1e-9);
            assert!(fill.filled_price <= 100.0 * 1.0005 + 1e-9);

            let mut acct = Account::new("a", 100_000.0, &symbols());
            let fill = ledger.execute(&mut acct, &sell("BTC", 1.0), &s).unwrap();
            assert!(fill.filled_price <= 100.0 * 0.9999 + 1e-9);
            assert!(fill.filled_price >= 100.0 * 0.9995 - 1e-9);
        }
    }

    #[test]
    fn trade_history_stays_bounded() {
        let params = SimParams { trade_history_cap: 5, ..params_no_slip() };
        let ledger = Ledger::new(params);
        let mut acct = Account::new("a", 1_000_000.0, &symbols());
        let s = snap(&[("BTC", 1.0)]);

        for _ in 0..20 {
            ledger.execute(&mut acct, &buy("BTC", 1.0), &s).unwrap();
        }
        assert_eq!(acct.trade_history.len(), 5);
        assert_eq!(acct.trades_count, 20);
    }
}
