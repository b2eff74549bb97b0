// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fanline.
//
// fanline is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fanline is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fanline.  If not,
// see <http://www.gnu.org/licenses/>.

//! # fanline metrics
//!
//! ## Introduction
//!
//! fanline's counters & gauges are [OpenTelemetry] instruments, which OTel asks us to build once
//! & re-use. Nobody wants an application state struct with a field per metric, and a centralized
//! list of every metric in the program is the kind of thing that rots; instead each module
//! declares its own metrics where they're used:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { Registration::new("distributor.fanouts.small", Sort::IntegralCounter) }
//! ```
//!
//! and [inventory] stitches the declarations together at link time. At startup, [Instruments]
//! walks the collected registrations & materializes one instrument apiece, sorted into a map per
//! instrument shape; call sites then go through [counter_add!] / [gauge_setu!], which look the
//! instrument up by name.
//!
//! ## On panicking
//!
//! Asking for a name that was never registered, or asking for a counter when the name was
//! registered as a gauge, is a defect in the calling code, not a runtime condition-- so the
//! lookup accessors refuse to limp along and panic instead. Registering the same name twice is
//! caught once, at [Instruments::new], before the process takes traffic.

use std::collections::{HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// The shape of a registered instrument
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<f64>`
    FloatGauge,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// One module's declaration of a metric: a name & the shape it should take
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Every registered instrument, built & ready
///
/// One map per shape, so a lookup hands back the concrete instrument type and the add/record
/// call needs no further dispatch.
pub struct Instruments {
    counters: HashMap<&'static str, Counter<u64>>,
    float_gauges: HashMap<&'static str, Gauge<f64>>,
    integral_gauges: HashMap<&'static str, Gauge<u64>>,
}

impl Instruments {
    /// Materialize every registration under the given meter name
    ///
    /// Panics if two registrations share a name (even with the same shape-- that's two call
    /// sites that each believe they own the metric).
    pub fn new(prefix: &'static str) -> Instruments {
        let mut seen: HashSet<&'static str> = HashSet::new();
        for reg in inventory::iter::<Registration> {
            if !seen.insert(reg.name()) {
                panic!("duplicate metric registration {:?}", reg.name());
            }
        }

        let meter = global::meter(prefix);
        let mut instruments = Instruments {
            counters: HashMap::new(),
            float_gauges: HashMap::new(),
            integral_gauges: HashMap::new(),
        };
        for reg in inventory::iter::<Registration> {
            let name = reg.name();
            match reg.sort() {
                Sort::IntegralCounter => {
                    instruments
                        .counters
                        .insert(name, meter.u64_counter(name).build());
                }
                Sort::FloatGauge => {
                    instruments
                        .float_gauges
                        .insert(name, meter.f64_gauge(name).build());
                }
                Sort::IntegralGauge => {
                    instruments
                        .integral_gauges
                        .insert(name, meter.u64_gauge(name).build());
                }
            }
        }
        instruments
    }
    /// The counter registered under `name`; panics if there isn't one
    pub fn counter(&self, name: &str) -> &Counter<u64> {
        self.counters
            .get(name)
            .unwrap_or_else(|| panic!("{:?} was not registered as a counter", name))
    }
    /// The float gauge registered under `name`; panics if there isn't one
    pub fn float_gauge(&self, name: &str) -> &Gauge<f64> {
        self.float_gauges
            .get(name)
            .unwrap_or_else(|| panic!("{:?} was not registered as a float gauge", name))
    }
    /// The integral gauge registered under `name`; panics if there isn't one
    pub fn integral_gauge(&self, name: &str) -> &Gauge<u64> {
        self.integral_gauges
            .get(name)
            .unwrap_or_else(|| panic!("{:?} was not registered as an integral gauge", name))
    }
}

/// Bump the named counter: `counter_add!(instruments, "feed.publishes", 1, &[])`
#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.counter($name).add($count, $attrs)
    };
}

/// Set the named integral gauge: `gauge_setu!(instruments, "consumer.inflight", n, &[])`
#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.integral_gauge($name).record($value, $attrs)
    };
}

/// Set the named float gauge
#[macro_export]
macro_rules! gauge_setf {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.float_gauge($name).record($value, $attrs)
    };
}

#[cfg(test)]
mod test {
    use super::*;

    inventory::submit! { Registration::new("test.lonely.counter", Sort::IntegralCounter) }
    inventory::submit! { Registration::new("test.lonely.gauge", Sort::IntegralGauge) }

    #[test]
    fn registered_instruments_resolve() {
        let instruments = Instruments::new("fanline-test");
        counter_add!(instruments, "test.lonely.counter", 2, &[]);
        gauge_setu!(instruments, "test.lonely.gauge", 7, &[]);
    }

    #[test]
    #[should_panic(expected = "was not registered as a counter")]
    fn a_gauge_is_not_a_counter() {
        let instruments = Instruments::new("fanline-test");
        counter_add!(instruments, "test.lonely.gauge", 1, &[]);
    }
}
