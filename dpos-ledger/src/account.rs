//! Account ledger
//!
//! Accounts change through typed diffs. Each [`Change`] names the field kind
//! it touches, so a merge can never treat a counter as a string or a
//! membership list as a scalar:
//!
//! - [`Change::Replace`] overwrites a string or boolean
//! - [`Change::Adjust`] adds a signed amount to a counter
//! - [`Change::Members`] adds or removes rows of a membership list
//!
//! Every confirmed balance movement, and every vote added or removed, is
//! mirrored into [`RoundLedgerEntry`] rows so a round's vote weights can be
//! settled later. All writes of one [`AccountLedger::transaction`] reach the
//! store in one atomic [`WriteSet`].

use crate::config::ChainConfig;
use crate::crypto::check_public_key;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::storage::{LedgerStore, WriteSet, UNASSIGNED_ROUND};
use crate::types::{Account, Block, RoundLedgerEntry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// Upper bound of `multimin`
pub const MULTIMIN_MAX: i64 = 15;

/// Upper bound of `multilifetime` (hours)
pub const MULTILIFETIME_MAX: i64 = 72;

/// Every account field, for filtering, sorting and projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AccountField {
    Address,
    PublicKey,
    SecondPublicKey,
    Username,
    UUsername,
    IsDelegate,
    UIsDelegate,
    SecondSignature,
    USecondSignature,
    NameExist,
    UNameExist,
    Balance,
    UBalance,
    Vote,
    Rate,
    Delegates,
    UDelegates,
    Multisignatures,
    UMultisignatures,
    Multimin,
    UMultimin,
    Multilifetime,
    UMultilifetime,
    BlockId,
    ProducedBlocks,
    MissedBlocks,
    Fees,
    Rewards,
    Virgin,
}

impl AccountField {
    /// All fields, in declaration order
    pub const ALL: [AccountField; 29] = [
        AccountField::Address,
        AccountField::PublicKey,
        AccountField::SecondPublicKey,
        AccountField::Username,
        AccountField::UUsername,
        AccountField::IsDelegate,
        AccountField::UIsDelegate,
        AccountField::SecondSignature,
        AccountField::USecondSignature,
        AccountField::NameExist,
        AccountField::UNameExist,
        AccountField::Balance,
        AccountField::UBalance,
        AccountField::Vote,
        AccountField::Rate,
        AccountField::Delegates,
        AccountField::UDelegates,
        AccountField::Multisignatures,
        AccountField::UMultisignatures,
        AccountField::Multimin,
        AccountField::UMultimin,
        AccountField::Multilifetime,
        AccountField::UMultilifetime,
        AccountField::BlockId,
        AccountField::ProducedBlocks,
        AccountField::MissedBlocks,
        AccountField::Fees,
        AccountField::Rewards,
        AccountField::Virgin,
    ];

    /// Wire name of the field
    pub fn name(&self) -> &'static str {
        match self {
            AccountField::Address => "address",
            AccountField::PublicKey => "publicKey",
            AccountField::SecondPublicKey => "secondPublicKey",
            AccountField::Username => "username",
            AccountField::UUsername => "u_username",
            AccountField::IsDelegate => "isDelegate",
            AccountField::UIsDelegate => "u_isDelegate",
            AccountField::SecondSignature => "secondSignature",
            AccountField::USecondSignature => "u_secondSignature",
            AccountField::NameExist => "nameexist",
            AccountField::UNameExist => "u_nameexist",
            AccountField::Balance => "balance",
            AccountField::UBalance => "u_balance",
            AccountField::Vote => "vote",
            AccountField::Rate => "rate",
            AccountField::Delegates => "delegates",
            AccountField::UDelegates => "u_delegates",
            AccountField::Multisignatures => "multisignatures",
            AccountField::UMultisignatures => "u_multisignatures",
            AccountField::Multimin => "multimin",
            AccountField::UMultimin => "u_multimin",
            AccountField::Multilifetime => "multilifetime",
            AccountField::UMultilifetime => "u_multilifetime",
            AccountField::BlockId => "blockId",
            AccountField::ProducedBlocks => "producedblocks",
            AccountField::MissedBlocks => "missedblocks",
            AccountField::Fees => "fees",
            AccountField::Rewards => "rewards",
            AccountField::Virgin => "virgin",
        }
    }
}

impl FromStr for AccountField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AccountField::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown account field: {}", s)))
    }
}

/// Value of one account field
///
/// Ordering compares within a kind; `Null` sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

fn text(value: &Option<String>) -> FieldValue {
    value.clone().map_or(FieldValue::Null, FieldValue::Text)
}

impl Account {
    /// Read one field
    pub fn field(&self, field: AccountField) -> FieldValue {
        match field {
            AccountField::Address => FieldValue::Text(self.address.clone()),
            AccountField::PublicKey => text(&self.public_key),
            AccountField::SecondPublicKey => text(&self.second_public_key),
            AccountField::Username => text(&self.username),
            AccountField::UUsername => text(&self.u_username),
            AccountField::IsDelegate => self.is_delegate.into(),
            AccountField::UIsDelegate => self.u_is_delegate.into(),
            AccountField::SecondSignature => self.second_signature.into(),
            AccountField::USecondSignature => self.u_second_signature.into(),
            AccountField::NameExist => self.name_exist.into(),
            AccountField::UNameExist => self.u_name_exist.into(),
            AccountField::Balance => self.balance.into(),
            AccountField::UBalance => self.u_balance.into(),
            AccountField::Vote => self.vote.into(),
            AccountField::Rate => self.rate.into(),
            AccountField::Delegates => FieldValue::List(self.delegates.clone()),
            AccountField::UDelegates => FieldValue::List(self.u_delegates.clone()),
            AccountField::Multisignatures => FieldValue::List(self.multisignatures.clone()),
            AccountField::UMultisignatures => FieldValue::List(self.u_multisignatures.clone()),
            AccountField::Multimin => self.multimin.into(),
            AccountField::UMultimin => self.u_multimin.into(),
            AccountField::Multilifetime => self.multilifetime.into(),
            AccountField::UMultilifetime => self.u_multilifetime.into(),
            AccountField::BlockId => text(&self.block_id),
            AccountField::ProducedBlocks => self.produced_blocks.into(),
            AccountField::MissedBlocks => self.missed_blocks.into(),
            AccountField::Fees => self.fees.into(),
            AccountField::Rewards => self.rewards.into(),
            AccountField::Virgin => self.virgin.into(),
        }
    }

    /// Copy of the account holding only `fields` (the address is always kept)
    pub fn project(&self, fields: &[AccountField]) -> Account {
        let mut out = Account::new(self.address.clone());
        for field in fields {
            match field {
                AccountField::Address => {}
                AccountField::PublicKey => out.public_key = self.public_key.clone(),
                AccountField::SecondPublicKey => {
                    out.second_public_key = self.second_public_key.clone()
                }
                AccountField::Username => out.username = self.username.clone(),
                AccountField::UUsername => out.u_username = self.u_username.clone(),
                AccountField::IsDelegate => out.is_delegate = self.is_delegate,
                AccountField::UIsDelegate => out.u_is_delegate = self.u_is_delegate,
                AccountField::SecondSignature => out.second_signature = self.second_signature,
                AccountField::USecondSignature => {
                    out.u_second_signature = self.u_second_signature
                }
                AccountField::NameExist => out.name_exist = self.name_exist,
                AccountField::UNameExist => out.u_name_exist = self.u_name_exist,
                AccountField::Balance => out.balance = self.balance,
                AccountField::UBalance => out.u_balance = self.u_balance,
                AccountField::Vote => out.vote = self.vote,
                AccountField::Rate => out.rate = self.rate,
                AccountField::Delegates => out.delegates = self.delegates.clone(),
                AccountField::UDelegates => out.u_delegates = self.u_delegates.clone(),
                AccountField::Multisignatures => {
                    out.multisignatures = self.multisignatures.clone()
                }
                AccountField::UMultisignatures => {
                    out.u_multisignatures = self.u_multisignatures.clone()
                }
                AccountField::Multimin => out.multimin = self.multimin,
                AccountField::UMultimin => out.u_multimin = self.u_multimin,
                AccountField::Multilifetime => out.multilifetime = self.multilifetime,
                AccountField::UMultilifetime => out.u_multilifetime = self.u_multilifetime,
                AccountField::BlockId => out.block_id = self.block_id.clone(),
                AccountField::ProducedBlocks => out.produced_blocks = self.produced_blocks,
                AccountField::MissedBlocks => out.missed_blocks = self.missed_blocks,
                AccountField::Fees => out.fees = self.fees,
                AccountField::Rewards => out.rewards = self.rewards,
                AccountField::Virgin => out.virgin = self.virgin,
            }
        }
        out
    }
}

/// String or boolean field overwritten by a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Replace {
    /// Immutable once set
    Username(String),
    /// Immutable once set
    UUsername(String),
    /// Immutable once set; must be 64 hex characters
    PublicKey(String),
    /// Immutable once set; must be 64 hex characters
    SecondPublicKey(String),
    IsDelegate(bool),
    UIsDelegate(bool),
    SecondSignature(bool),
    USecondSignature(bool),
    NameExist(bool),
    UNameExist(bool),
    BlockId(String),
}

/// Integer field adjusted by a signed amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Counter {
    Balance,
    UBalance,
    Vote,
    Rate,
    Multimin,
    UMultimin,
    Multilifetime,
    UMultilifetime,
    ProducedBlocks,
    MissedBlocks,
    Fees,
    Rewards,
}

impl Counter {
    /// Wire name of the counter
    pub fn name(&self) -> &'static str {
        match self {
            Counter::Balance => "balance",
            Counter::UBalance => "u_balance",
            Counter::Vote => "vote",
            Counter::Rate => "rate",
            Counter::Multimin => "multimin",
            Counter::UMultimin => "u_multimin",
            Counter::Multilifetime => "multilifetime",
            Counter::UMultilifetime => "u_multilifetime",
            Counter::ProducedBlocks => "producedblocks",
            Counter::MissedBlocks => "missedblocks",
            Counter::Fees => "fees",
            Counter::Rewards => "rewards",
        }
    }

    fn slot<'a>(&self, account: &'a mut Account) -> &'a mut i64 {
        match self {
            Counter::Balance => &mut account.balance,
            Counter::UBalance => &mut account.u_balance,
            Counter::Vote => &mut account.vote,
            Counter::Rate => &mut account.rate,
            Counter::Multimin => &mut account.multimin,
            Counter::UMultimin => &mut account.u_multimin,
            Counter::Multilifetime => &mut account.multilifetime,
            Counter::UMultilifetime => &mut account.u_multilifetime,
            Counter::ProducedBlocks => &mut account.produced_blocks,
            Counter::MissedBlocks => &mut account.missed_blocks,
            Counter::Fees => &mut account.fees,
            Counter::Rewards => &mut account.rewards,
        }
    }
}

/// Membership list stored as rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum MemberList {
    Delegates,
    UDelegates,
    Multisignatures,
    UMultisignatures,
}

impl MemberList {
    /// Wire name of the list
    pub fn name(&self) -> &'static str {
        match self {
            MemberList::Delegates => "delegates",
            MemberList::UDelegates => "u_delegates",
            MemberList::Multisignatures => "multisignatures",
            MemberList::UMultisignatures => "u_multisignatures",
        }
    }

    fn slot<'a>(&self, account: &'a mut Account) -> &'a mut Vec<String> {
        match self {
            MemberList::Delegates => &mut account.delegates,
            MemberList::UDelegates => &mut account.u_delegates,
            MemberList::Multisignatures => &mut account.multisignatures,
            MemberList::UMultisignatures => &mut account.u_multisignatures,
        }
    }

    fn is_vote_list(&self) -> bool {
        matches!(self, MemberList::Delegates | MemberList::UDelegates)
    }
}

/// One membership row change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Member {
    /// Insert a row; fails if it already exists
    Add(String),
    /// Delete a row if present
    Remove(String),
}

/// One field change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// Overwrite a string or boolean
    Replace(Replace),
    /// Add a signed amount to a counter
    Adjust(Counter, i64),
    /// Insert or delete membership rows
    Members(MemberList, Vec<Member>),
}

/// Set of changes applied to one account
///
/// `block_id` and `round` tag any round ledger entries the diff produces; a
/// `block_id` is also recorded on the account itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDiff {
    /// Changes, applied in order
    pub changes: Vec<Change>,
    /// Block causing the diff
    pub block_id: Option<String>,
    /// Round the diff belongs to
    pub round: Option<u64>,
}

impl AccountDiff {
    /// Empty diff
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signed amount to a counter
    pub fn adjust(mut self, counter: Counter, amount: i64) -> Self {
        self.changes.push(Change::Adjust(counter, amount));
        self
    }

    /// Overwrite a string or boolean field
    pub fn replace(mut self, value: Replace) -> Self {
        self.changes.push(Change::Replace(value));
        self
    }

    /// Insert a membership row
    pub fn add(mut self, list: MemberList, member: impl Into<String>) -> Self {
        self.changes
            .push(Change::Members(list, vec![Member::Add(member.into())]));
        self
    }

    /// Delete a membership row
    pub fn remove(mut self, list: MemberList, member: impl Into<String>) -> Self {
        self.changes
            .push(Change::Members(list, vec![Member::Remove(member.into())]));
        self
    }

    /// Tag the diff with the block and round causing it
    pub fn in_block(mut self, block_id: impl Into<String>, round: u64) -> Self {
        self.block_id = Some(block_id.into());
        self.round = Some(round);
        self
    }

    /// Whether the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.block_id.is_none()
    }
}

/// Bounds enforced on every merge
#[derive(Debug, Clone)]
pub struct MergeRules {
    /// Ceiling for `balance` and `u_balance`
    pub total_amount: i64,
    /// Maximum entries in a vote list
    pub max_votes: usize,
}

impl From<&ChainConfig> for MergeRules {
    fn from(config: &ChainConfig) -> Self {
        Self {
            total_amount: config.total_amount,
            max_votes: config.max_votes_per_account,
        }
    }
}

fn set_once(slot: &mut Option<String>, value: &str, field: &str) -> Result<()> {
    match slot {
        Some(current) if current != value => {
            Err(Error::Validation(format!("{} is immutable once set", field)))
        }
        _ => {
            *slot = Some(value.to_string());
            Ok(())
        }
    }
}

fn replace(account: &mut Account, value: &Replace) -> Result<()> {
    match value {
        Replace::Username(v) => set_once(&mut account.username, v, "username")?,
        Replace::UUsername(v) => set_once(&mut account.u_username, v, "u_username")?,
        Replace::PublicKey(v) => set_once(&mut account.public_key, v, "publicKey")?,
        Replace::SecondPublicKey(v) => {
            set_once(&mut account.second_public_key, v, "secondPublicKey")?
        }
        Replace::IsDelegate(v) => account.is_delegate = *v,
        Replace::UIsDelegate(v) => account.u_is_delegate = *v,
        Replace::SecondSignature(v) => account.second_signature = *v,
        Replace::USecondSignature(v) => account.u_second_signature = *v,
        Replace::NameExist(v) => account.name_exist = *v,
        Replace::UNameExist(v) => account.u_name_exist = *v,
        Replace::BlockId(v) => account.block_id = Some(v.clone()),
    }
    Ok(())
}

fn adjust(account: &mut Account, counter: Counter, amount: i64, rules: &MergeRules) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    if matches!(counter, Counter::ProducedBlocks | Counter::MissedBlocks) && amount.abs() > 1 {
        return Err(Error::Validation(format!(
            "{} changes by at most 1 per diff, got {}",
            counter.name(),
            amount
        )));
    }

    let current = *counter.slot(account);
    let next = current.checked_add(amount).ok_or_else(|| {
        Error::Validation(format!("{} overflows adding {}", counter.name(), amount))
    })?;

    match counter {
        Counter::Balance | Counter::UBalance => {
            if next < 0 {
                return Err(Error::InsufficientFunds {
                    address: account.address.clone(),
                    field: counter.name(),
                    available: current,
                    requested: -amount,
                });
            }
            if next > rules.total_amount {
                return Err(Error::Validation(format!(
                    "{} {} exceeds total supply {}",
                    counter.name(),
                    next,
                    rules.total_amount
                )));
            }
        }
        Counter::Multimin | Counter::UMultimin if !(0..=MULTIMIN_MAX).contains(&next) => {
            return Err(Error::Validation(format!(
                "{} {} outside 0..={}",
                counter.name(),
                next,
                MULTIMIN_MAX
            )));
        }
        Counter::Multilifetime | Counter::UMultilifetime
            if !(0..=MULTILIFETIME_MAX).contains(&next) =>
        {
            return Err(Error::Validation(format!(
                "{} {} outside 0..={}",
                counter.name(),
                next,
                MULTILIFETIME_MAX
            )));
        }
        _ => {}
    }

    if counter == Counter::UBalance && amount < 0 {
        account.virgin = false;
    }
    *counter.slot(account) = next;
    Ok(())
}

/// Apply a diff to an account in place and return the round entries it
/// produces
///
/// Round entries are computed from the account as it stands after every
/// change in the diff: a balance movement is attributed to each delegate in
/// the final confirmed vote list, and an added (removed) vote carries the
/// final balance (its negation).
pub fn apply_diff(
    account: &mut Account,
    diff: &AccountDiff,
    rules: &MergeRules,
) -> Result<Vec<RoundLedgerEntry>> {
    for change in &diff.changes {
        if let Change::Replace(Replace::PublicKey(key) | Replace::SecondPublicKey(key)) = change {
            check_public_key(key)?;
        }
    }

    if let Some(block_id) = &diff.block_id {
        account.block_id = Some(block_id.clone());
    }

    let mut balance_moves = Vec::new();
    let mut vote_moves: Vec<(String, i64)> = Vec::new();

    for change in &diff.changes {
        match change {
            Change::Replace(value) => replace(account, value)?,
            Change::Adjust(counter, amount) => {
                adjust(account, *counter, *amount, rules)?;
                if *counter == Counter::Balance && *amount != 0 {
                    balance_moves.push(*amount);
                }
            }
            Change::Members(list, members) => {
                for member in members {
                    let rows = list.slot(account);
                    match member {
                        Member::Add(key) => {
                            if rows.contains(key) {
                                return Err(Error::Ledger(format!(
                                    "{} already holds {} for {}",
                                    list.name(),
                                    key,
                                    account.address
                                )));
                            }
                            rows.push(key.clone());
                            if *list == MemberList::Delegates {
                                vote_moves.push((key.clone(), 1));
                            }
                        }
                        Member::Remove(key) => {
                            if let Some(position) = rows.iter().position(|row| row == key) {
                                rows.remove(position);
                                if *list == MemberList::Delegates {
                                    vote_moves.push((key.clone(), -1));
                                }
                            }
                        }
                    }
                }
                if list.is_vote_list() && list.slot(account).len() > rules.max_votes {
                    return Err(Error::Validation(format!(
                        "{} exceeds {} votes",
                        list.name(),
                        rules.max_votes
                    )));
                }
            }
        }
    }

    let entry = |amount: i64, delegate: &str| RoundLedgerEntry {
        address: account.address.clone(),
        amount,
        delegate: delegate.to_string(),
        block_id: diff.block_id.clone(),
        round: diff.round,
    };

    let mut entries = Vec::new();
    for amount in balance_moves {
        for delegate in &account.delegates {
            entries.push(entry(amount, delegate));
        }
    }
    for (delegate, sign) in vote_moves {
        entries.push(entry(sign * account.balance, &delegate));
    }

    Ok(entries)
}

/// Comparison applied by a [`Condition`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Op {
    Eq(FieldValue),
    Gt(FieldValue),
    Gte(FieldValue),
    Lt(FieldValue),
    Lte(FieldValue),
    In(Vec<FieldValue>),
}

/// Predicate on one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Field tested
    pub field: AccountField,
    /// Comparison
    pub op: Op,
}

impl Condition {
    fn matches(&self, account: &Account) -> bool {
        let value = account.field(self.field);
        match &self.op {
            Op::Eq(v) => value == *v,
            Op::Gt(v) => value > *v,
            Op::Gte(v) => value >= *v,
            Op::Lt(v) => value < *v,
            Op::Lte(v) => value <= *v,
            Op::In(values) => values.contains(&value),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Account query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// All must hold
    pub conditions: Vec<Condition>,
    /// Sort keys, most significant first
    pub sort: Vec<(AccountField, SortOrder)>,
    /// Maximum rows (0 or absent means unlimited)
    pub limit: Option<usize>,
    /// Rows skipped (0 or absent means none)
    pub offset: Option<usize>,
}

impl Filter {
    /// Matches every account
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches one address
    pub fn address(address: impl Into<String>) -> Self {
        let address: String = address.into();
        Self::all().field_eq(AccountField::Address, address)
    }

    /// Add an equality condition
    pub fn field_eq(self, field: AccountField, value: impl Into<FieldValue>) -> Self {
        self.with(field, Op::Eq(value.into()))
    }

    /// Add any condition
    pub fn with(mut self, field: AccountField, op: Op) -> Self {
        self.conditions.push(Condition { field, op });
        self
    }

    /// Add a sort key
    pub fn sort(mut self, field: AccountField, order: SortOrder) -> Self {
        self.sort.push((field, order));
        self
    }

    /// Cap the number of rows
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip leading rows
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    fn matches(&self, account: &Account) -> bool {
        self.conditions.iter().all(|c| c.matches(account))
    }

    fn address_lookup(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match (&c.field, &c.op) {
            (AccountField::Address, Op::Eq(FieldValue::Text(address))) => Some(address.as_str()),
            _ => None,
        })
    }

    fn compare(&self, a: &Account, b: &Account) -> Ordering {
        for (field, order) in &self.sort {
            let ordering = a.field(*field).cmp(&b.field(*field));
            let ordering = match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn select(&self, candidates: Vec<Account>, fields: Option<&[AccountField]>) -> Vec<Account> {
        let mut rows: Vec<Account> = candidates.into_iter().filter(|a| self.matches(a)).collect();
        if !self.sort.is_empty() {
            rows.sort_by(|a, b| self.compare(a, b));
        }

        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.filter(|&limit| limit > 0).unwrap_or(usize::MAX);

        rows.into_iter()
            .skip(offset)
            .take(limit)
            .map(|account| match fields {
                Some(fields) => account.project(fields),
                None => account,
            })
            .collect()
    }
}

/// Staged writes of one ledger transaction
///
/// Reads see the transaction's own writes. Nothing reaches the store until
/// the closure passed to [`AccountLedger::transaction`] returns `Ok`.
pub struct LedgerTx<'a> {
    store: &'a dyn LedgerStore,
    rules: &'a MergeRules,
    staged: BTreeMap<String, Option<Account>>,
    entries: Vec<RoundLedgerEntry>,
    cleared: Vec<u64>,
    blocks: Vec<Block>,
    merges: u64,
}

impl std::fmt::Debug for LedgerTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerTx")
            .field("staged", &self.staged.len())
            .field("entries", &self.entries.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl<'a> LedgerTx<'a> {
    fn new(store: &'a dyn LedgerStore, rules: &'a MergeRules) -> Self {
        Self {
            store,
            rules,
            staged: BTreeMap::new(),
            entries: Vec::new(),
            cleared: Vec::new(),
            blocks: Vec::new(),
            merges: 0,
        }
    }

    /// Account by address
    pub fn get(&self, address: &str) -> Result<Option<Account>> {
        if let Some(staged) = self.staged.get(address) {
            return Ok(staged.clone());
        }
        self.store.get_account(address)
    }

    /// Accounts matching a filter
    pub fn list(&self, filter: &Filter, fields: Option<&[AccountField]>) -> Result<Vec<Account>> {
        let candidates = match filter.address_lookup() {
            Some(address) => self.get(address)?.into_iter().collect(),
            None => {
                let mut all: BTreeMap<String, Account> = self
                    .store
                    .accounts()?
                    .into_iter()
                    .map(|account| (account.address.clone(), account))
                    .collect();
                for (address, staged) in &self.staged {
                    match staged {
                        Some(account) => {
                            all.insert(address.clone(), account.clone());
                        }
                        None => {
                            all.remove(address);
                        }
                    }
                }
                all.into_values().collect()
            }
        };
        Ok(filter.select(candidates, fields))
    }

    /// Upsert scalar fields
    ///
    /// Counters and membership lists cannot be written this way; they only
    /// change through [`LedgerTx::merge`].
    pub fn set(&mut self, address: &str, fields: &[Replace]) -> Result<Account> {
        let mut account = self.get(address)?.unwrap_or_else(|| Account::new(address));
        for value in fields {
            if let Replace::PublicKey(key) | Replace::SecondPublicKey(key) = value {
                check_public_key(key).map_err(|err| Error::Validation(err.to_string()))?;
            }
            replace(&mut account, value)?;
        }
        self.staged.insert(address.to_string(), Some(account.clone()));
        Ok(account)
    }

    /// Apply a diff, creating the account if it does not exist
    pub fn merge(&mut self, address: &str, diff: &AccountDiff) -> Result<Account> {
        let mut account = self.get(address)?.unwrap_or_else(|| Account::new(address));
        let entries = apply_diff(&mut account, diff, self.rules)?;

        tracing::trace!(
            address,
            changes = diff.changes.len(),
            round_entries = entries.len(),
            "Account merged"
        );

        self.entries.extend(entries);
        self.staged.insert(address.to_string(), Some(account.clone()));
        self.merges += 1;
        Ok(account)
    }

    /// Delete an account
    pub fn remove(&mut self, address: &str) -> Result<String> {
        self.staged.insert(address.to_string(), None);
        Ok(address.to_string())
    }

    /// Entries of a round, stored and staged
    pub fn round_entries(&self, round: u64) -> Result<Vec<RoundLedgerEntry>> {
        let mut entries = if self.cleared.contains(&round) {
            Vec::new()
        } else {
            self.store.round_entries(round)?
        };
        entries.extend(
            self.entries
                .iter()
                .filter(|entry| entry.round.unwrap_or(UNASSIGNED_ROUND) == round)
                .cloned(),
        );
        Ok(entries)
    }

    /// Delete every entry of a round
    pub fn clear_round(&mut self, round: u64) {
        if !self.cleared.contains(&round) {
            self.cleared.push(round);
        }
        self.entries
            .retain(|entry| entry.round.unwrap_or(UNASSIGNED_ROUND) != round);
    }

    /// Stage a block
    pub fn put_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Id of the staged or stored block that confirmed a transaction
    pub fn transaction_block(&self, tx_id: &str) -> Result<Option<String>> {
        let staged = self
            .blocks
            .iter()
            .find(|block| block.transactions.iter().any(|tx| tx.id == tx_id));
        if let Some(block) = staged {
            return Ok(Some(block.id.clone().unwrap_or_default()));
        }
        self.store.transaction_block(tx_id)
    }

    /// Block at a height, staged or stored
    pub fn block_at(&self, height: u64) -> Result<Option<Block>> {
        if let Some(block) = self.blocks.iter().rev().find(|b| b.height == height) {
            return Ok(Some(block.clone()));
        }
        self.store.block_at(height)
    }

    /// Highest block, staged or stored
    pub fn last_block(&self) -> Result<Option<Block>> {
        let stored = self.store.last_block()?;
        let staged = self.blocks.iter().max_by_key(|b| b.height).cloned();
        Ok(match (stored, staged) {
            (Some(stored), Some(staged)) if stored.height > staged.height => Some(stored),
            (stored, None) => stored,
            (_, staged) => staged,
        })
    }

    fn into_writes(self) -> (WriteSet, u64) {
        let mut writes = WriteSet::default();
        for (address, staged) in self.staged {
            match staged {
                Some(account) => writes.accounts.push(account),
                None => writes.removed.push(address),
            }
        }
        writes.cleared_rounds = self.cleared;
        writes.round_entries = self.entries;
        writes.blocks = self.blocks;
        (writes, self.merges)
    }
}

/// Account store with atomic multi-account transactions
#[derive(Clone)]
pub struct AccountLedger {
    store: Arc<dyn LedgerStore>,
    rules: MergeRules,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for AccountLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLedger")
            .field("rules", &self.rules)
            .finish()
    }
}

impl AccountLedger {
    /// Ledger over a store
    pub fn new(store: Arc<dyn LedgerStore>, chain: &ChainConfig) -> Self {
        Self {
            store,
            rules: MergeRules::from(chain),
            metrics: None,
        }
    }

    /// Record merge and round entry counts
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Run `f` against staged state and commit its writes atomically
    ///
    /// If `f` fails, nothing it staged is written.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> Result<T>,
    {
        let mut tx = LedgerTx::new(self.store.as_ref(), &self.rules);
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, staged = ?tx, "Ledger transaction rolled back");
                return Err(err);
            }
        };

        let (writes, merges) = tx.into_writes();
        let entries = writes.round_entries.len() as u64;
        if !writes.is_empty() {
            self.store.commit(writes)?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.account_merges.inc_by(merges);
            metrics.round_entries.inc_by(entries);
        }
        Ok(value)
    }

    /// First account matching a filter
    pub fn get(&self, filter: &Filter, fields: Option<&[AccountField]>) -> Result<Option<Account>> {
        Ok(self.list(filter, fields)?.into_iter().next())
    }

    /// Accounts matching a filter
    pub fn list(&self, filter: &Filter, fields: Option<&[AccountField]>) -> Result<Vec<Account>> {
        LedgerTx::new(self.store.as_ref(), &self.rules).list(filter, fields)
    }

    /// Upsert scalar fields of one account
    pub fn set(&self, address: &str, fields: &[Replace]) -> Result<Account> {
        self.transaction(|tx| tx.set(address, fields))
    }

    /// Apply a diff to one account
    pub fn merge(&self, address: &str, diff: &AccountDiff) -> Result<Account> {
        self.transaction(|tx| tx.merge(address, diff))
    }

    /// Delete one account
    pub fn remove(&self, address: &str) -> Result<String> {
        self.transaction(|tx| tx.remove(address))
    }

    /// Entries recorded for a round
    pub fn round_entries(&self, round: u64) -> Result<Vec<RoundLedgerEntry>> {
        self.store.round_entries(round)
    }

    /// Delete every entry of a round
    pub fn delete_round_entries(&self, round: u64) -> Result<()> {
        self.transaction(|tx| {
            tx.clear_round(round);
            Ok(())
        })
    }
}
