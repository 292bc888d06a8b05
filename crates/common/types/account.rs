use ethereum_types::U256;

/// The slice of account state the networking core needs: nonce and balance,
/// read through the external state interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
}

impl Account {
    pub fn new(nonce: u64, balance: U256) -> Self {
        Self { nonce, balance }
    }
}
