// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The backbone declares exactly two exchanges per connection: the application
//! topic exchange that publishers write to, and the dead-letter topic exchange
//! that failed deliveries are routed through. Both are durable topic
//! exchanges.

/// Definition of a durable topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchanges_are_durable() {
        let def = ExchangeDefinition::new("app");

        assert_eq!(def.name(), "app");
        assert!(def.durable);
    }
}
