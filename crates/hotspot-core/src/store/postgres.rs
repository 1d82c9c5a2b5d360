// PostgreSQL store
//
// Runtime-checked queries over a `PgPool`. Enum columns are stored as their
// snake_case strings (guarded by CHECK constraints) and parsed back through
// `FromStr`. Migrations are embedded and applied linearly at connect time.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres};
use tracing::{info, warn};
use uuid::Uuid;

use super::{LedgerAppend, Store, StoreTx};
use crate::error::CoreError;
use crate::model::{
    AddressListAudit, DebtId, LedgerEntry, MacAddress, Package, PackageId, PhoneNumber,
    Transaction, TransactionEvent, TransactionId, User, UserDevice, UserDeviceId, UserId,
    UserQuotaDebt,
};

/// Linear migrations, applied in order and recorded in `schema_migrations`.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../../migrations/0001_init.sql"))];

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn parse_column<T: FromStr>(column: &str, raw: &str) -> Result<T, CoreError> {
    raw.parse().map_err(|_| CoreError::Storage {
        message: format!("unexpected value '{raw}' in column {column}"),
    })
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, then apply pending migrations.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let opts = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), CoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version     BIGINT PRIMARY KEY,
                applied_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;

        for (version, schema) in MIGRATIONS {
            let applied: Option<i64> =
                sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = $1")
                    .bind(version)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            // One statement per prepared query.
            let mut tx = self.pool.begin().await?;
            for statement in schema_statements(schema) {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied migration");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn load_settings(&self) -> Result<HashMap<String, String>, CoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM application_settings")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        sqlx::query(
            r"
            INSERT INTO application_settings (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ── Row types ───────────────────────────────────────────────────────

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    phone: String,
    full_name: String,
    blok: Option<String>,
    kamar: Option<String>,
    role: String,
    approval_status: String,
    is_active: bool,
    is_blocked: bool,
    blocked_reason: Option<String>,
    blocked_at: Option<DateTime<Utc>>,
    blocked_by: Option<Uuid>,
    hotspot_username: String,
    hotspot_password: Option<String>,
    hotspot_profile: Option<String>,
    hotspot_server: Option<String>,
    is_provisioned: bool,
    purchased_mb: i64,
    used_mb: Decimal,
    expiry: Option<DateTime<Utc>>,
    is_unlimited: bool,
    auto_debt_offset_mb: i64,
    manual_debt_mb: i64,
    last_quota_notice: Option<String>,
    last_expiry_notice_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = CoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            phone: PhoneNumber::try_from(row.phone)?,
            full_name: row.full_name,
            blok: row.blok,
            kamar: row.kamar,
            role: parse_column("users.role", &row.role)?,
            approval_status: parse_column("users.approval_status", &row.approval_status)?,
            is_active: row.is_active,
            is_blocked: row.is_blocked,
            blocked_reason: row.blocked_reason,
            blocked_at: row.blocked_at,
            blocked_by: row.blocked_by.map(UserId::from),
            hotspot_username: row.hotspot_username,
            hotspot_password: row.hotspot_password,
            hotspot_profile: row.hotspot_profile,
            hotspot_server: row.hotspot_server,
            is_provisioned: row.is_provisioned,
            purchased_mb: row.purchased_mb,
            used_mb: row.used_mb,
            expiry: row.expiry,
            is_unlimited: row.is_unlimited,
            auto_debt_offset_mb: row.auto_debt_offset_mb,
            manual_debt_mb: row.manual_debt_mb,
            last_quota_notice: row.last_quota_notice,
            last_expiry_notice_at: row.last_expiry_notice_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct DeviceRow {
    id: Uuid,
    user_id: Uuid,
    mac: String,
    last_ip: Option<String>,
    authorized: bool,
    label: Option<String>,
    bytes_in: i64,
    bytes_out: i64,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    authorized_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for UserDevice {
    type Error = CoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            user_id: row.user_id.into(),
            mac: MacAddress::try_from(row.mac)?,
            last_ip: row.last_ip,
            authorized: row.authorized,
            label: row.label,
            bytes_in: row.bytes_in,
            bytes_out: row.bytes_out,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            authorized_at: row.authorized_at,
        })
    }
}

#[derive(FromRow)]
struct PackageRow {
    id: Uuid,
    name: String,
    price: i64,
    quota_gb: Decimal,
    duration_days: i64,
    is_active: bool,
}

impl From<PackageRow> for Package {
    fn from(row: PackageRow) -> Self {
        Self {
            id: row.id.into(),
            name: row.name,
            price: row.price,
            quota_gb: row.quota_gb,
            duration_days: row.duration_days,
            is_active: row.is_active,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    package_id: Option<Uuid>,
    order_id: String,
    amount: i64,
    status: String,
    payment_method: Option<String>,
    va_number: Option<String>,
    qr_code_url: Option<String>,
    snap_token: Option<String>,
    redirect_url: Option<String>,
    expiry_time: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    raw_payload: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = CoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            user_id: row.user_id.into(),
            package_id: row.package_id.map(PackageId::from),
            order_id: row.order_id,
            amount: row.amount,
            status: parse_column("transactions.status", &row.status)?,
            payment_method: row.payment_method,
            va_number: row.va_number,
            qr_code_url: row.qr_code_url,
            snap_token: row.snap_token,
            redirect_url: row.redirect_url,
            expiry_time: row.expiry_time,
            paid_at: row.paid_at,
            raw_payload: row.raw_payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    transaction_id: Uuid,
    source: String,
    event_type: String,
    status: String,
    payload: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for TransactionEvent {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            transaction_id: row.transaction_id.into(),
            source: parse_column("transaction_events.source", &row.source)?,
            event_type: row.event_type,
            status: parse_column("transaction_events.status", &row.status)?,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct DebtRow {
    id: Uuid,
    user_id: Uuid,
    debt_date: Option<NaiveDate>,
    amount_mb: i64,
    paid_mb: i64,
    is_paid: bool,
    created_by: Option<Uuid>,
    note: Option<String>,
    last_paid_source: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<DebtRow> for UserQuotaDebt {
    fn from(row: DebtRow) -> Self {
        Self {
            id: row.id.into(),
            user_id: row.user_id.into(),
            debt_date: row.debt_date,
            amount_mb: row.amount_mb,
            paid_mb: row.paid_mb,
            is_paid: row.is_paid,
            created_by: row.created_by.map(UserId::from),
            note: row.note,
            last_paid_source: row.last_paid_source,
            paid_at: row.paid_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct LedgerRow {
    id: Uuid,
    user_id: Uuid,
    actor_id: Option<Uuid>,
    source: String,
    idempotency_key: String,
    before_state: serde_json::Value,
    after_state: serde_json::Value,
    event_details: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id.into(),
            actor_id: row.actor_id.map(UserId::from),
            source: row.source,
            idempotency_key: row.idempotency_key,
            before_state: row.before_state,
            after_state: row.after_state,
            event_details: row.event_details,
            created_at: row.created_at,
        }
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, CoreError>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ── Transaction ─────────────────────────────────────────────────────

struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

const USER_COLUMNS: &str = "id, phone, full_name, blok, kamar, role, approval_status, is_active, \
    is_blocked, blocked_reason, blocked_at, blocked_by, hotspot_username, hotspot_password, \
    hotspot_profile, hotspot_server, is_provisioned, purchased_mb, used_mb, expiry, is_unlimited, \
    auto_debt_offset_mb, manual_debt_mb, last_quota_notice, last_expiry_notice_at, created_at, \
    updated_at";

impl PgTx {
    async fn fetch_user(&mut self, sql: &str, id: Uuid) -> Result<Option<User>, CoreError> {
        sqlx::query_as::<_, UserRow>(sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn write_user(&mut self, sql: &str, user: &User) -> Result<u64, CoreError> {
        let result = sqlx::query(sql)
            .bind(user.id.as_uuid())
            .bind(user.phone.as_str())
            .bind(&user.full_name)
            .bind(&user.blok)
            .bind(&user.kamar)
            .bind(user.role.as_ref())
            .bind(user.approval_status.as_ref())
            .bind(user.is_active)
            .bind(user.is_blocked)
            .bind(&user.blocked_reason)
            .bind(user.blocked_at)
            .bind(user.blocked_by.map(|id| id.as_uuid()))
            .bind(&user.hotspot_username)
            .bind(&user.hotspot_password)
            .bind(&user.hotspot_profile)
            .bind(&user.hotspot_server)
            .bind(user.is_provisioned)
            .bind(user.purchased_mb)
            .bind(user.used_mb)
            .bind(user.expiry)
            .bind(user.is_unlimited)
            .bind(user.auto_debt_offset_mb)
            .bind(user.manual_debt_mb)
            .bind(&user.last_quota_notice)
            .bind(user.last_expiry_notice_at)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_transaction(&mut self, sql: &str, txn: &Transaction) -> Result<u64, CoreError> {
        let result = sqlx::query(sql)
            .bind(txn.id.as_uuid())
            .bind(txn.user_id.as_uuid())
            .bind(txn.package_id.map(|id| id.as_uuid()))
            .bind(&txn.order_id)
            .bind(txn.amount)
            .bind(txn.status.as_ref())
            .bind(&txn.payment_method)
            .bind(&txn.va_number)
            .bind(&txn.qr_code_url)
            .bind(&txn.snap_token)
            .bind(&txn.redirect_url)
            .bind(txn.expiry_time)
            .bind(txn.paid_at)
            .bind(&txn.raw_payload)
            .bind(txn.created_at)
            .bind(txn.updated_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_debt(&mut self, sql: &str, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        sqlx::query(sql)
            .bind(debt.id.as_uuid())
            .bind(debt.user_id.as_uuid())
            .bind(debt.debt_date)
            .bind(debt.amount_mb)
            .bind(debt.paid_mb)
            .bind(debt.is_paid)
            .bind(debt.created_by.map(|id| id.as_uuid()))
            .bind(&debt.note)
            .bind(&debt.last_paid_source)
            .bind(debt.paid_at)
            .bind(debt.created_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    // ── Users ────────────────────────────────────────────────────────

    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, CoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        self.fetch_user(&sql, id.as_uuid()).await
    }

    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, CoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
        self.fetch_user(&sql, id.as_uuid()).await
    }

    async fn find_user_by_phone(&mut self, phone: &PhoneNumber) -> Result<Option<User>, CoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE phone = $1");
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(phone.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), CoreError> {
        let sql = format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
             $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, \
             $26, $27)"
        );
        self.write_user(&sql, user).await.map(|_| ())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), CoreError> {
        let sql = "UPDATE users SET phone = $2, full_name = $3, blok = $4, kamar = $5, role = $6, \
             approval_status = $7, is_active = $8, is_blocked = $9, blocked_reason = $10, \
             blocked_at = $11, blocked_by = $12, hotspot_username = $13, hotspot_password = $14, \
             hotspot_profile = $15, hotspot_server = $16, is_provisioned = $17, \
             purchased_mb = $18, used_mb = $19, expiry = $20, is_unlimited = $21, \
             auto_debt_offset_mb = $22, manual_debt_mb = $23, last_quota_notice = $24, \
             last_expiry_notice_at = $25, created_at = $26, updated_at = $27 WHERE id = $1";
        match self.write_user(sql, user).await? {
            0 => Err(CoreError::not_found("user", user.id)),
            _ => Ok(()),
        }
    }

    async fn active_user_ids(&mut self) -> Result<Vec<UserId>, CoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM users WHERE is_active AND approval_status = 'approved' ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }

    async fn users_with_manual_debt(&mut self) -> Result<Vec<UserId>, CoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM users WHERE manual_debt_mb > 0 ORDER BY id")
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }

    // ── Devices ──────────────────────────────────────────────────────

    async fn devices_for_user(&mut self, user_id: UserId) -> Result<Vec<UserDevice>, CoreError> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT * FROM user_devices WHERE user_id = $1 ORDER BY first_seen_at",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn get_device(&mut self, id: UserDeviceId) -> Result<Option<UserDevice>, CoreError> {
        sqlx::query_as::<_, DeviceRow>("SELECT * FROM user_devices WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(UserDevice::try_from)
            .transpose()
    }

    async fn authorized_device_by_mac(
        &mut self,
        mac: &MacAddress,
    ) -> Result<Option<UserDevice>, CoreError> {
        sqlx::query_as::<_, DeviceRow>(
            "SELECT * FROM user_devices WHERE mac = $1 AND authorized FOR UPDATE",
        )
        .bind(mac.as_str())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(UserDevice::try_from)
        .transpose()
    }

    async fn upsert_device(&mut self, device: &UserDevice) -> Result<(), CoreError> {
        sqlx::query(
            r"
            INSERT INTO user_devices (id, user_id, mac, last_ip, authorized, label, bytes_in,
                                      bytes_out, first_seen_at, last_seen_at, authorized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                mac = EXCLUDED.mac,
                last_ip = EXCLUDED.last_ip,
                authorized = EXCLUDED.authorized,
                label = EXCLUDED.label,
                bytes_in = EXCLUDED.bytes_in,
                bytes_out = EXCLUDED.bytes_out,
                last_seen_at = EXCLUDED.last_seen_at,
                authorized_at = EXCLUDED.authorized_at
            ",
        )
        .bind(device.id.as_uuid())
        .bind(device.user_id.as_uuid())
        .bind(device.mac.as_str())
        .bind(&device.last_ip)
        .bind(device.authorized)
        .bind(&device.label)
        .bind(device.bytes_in)
        .bind(device.bytes_out)
        .bind(device.first_seen_at)
        .bind(device.last_seen_at)
        .bind(device.authorized_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_device(&mut self, id: UserDeviceId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM user_devices WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ── Packages ─────────────────────────────────────────────────────

    async fn get_package(&mut self, id: PackageId) -> Result<Option<Package>, CoreError> {
        let row = sqlx::query_as::<_, PackageRow>("SELECT * FROM packages WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Package::from))
    }

    async fn insert_package(&mut self, package: &Package) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO packages (id, name, price, quota_gb, duration_days, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(package.id.as_uuid())
        .bind(&package.name)
        .bind(package.price)
        .bind(package.quota_gb)
        .bind(package.duration_days)
        .bind(package.is_active)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // ── Transactions ─────────────────────────────────────────────────

    async fn get_transaction(&mut self, order_id: &str) -> Result<Option<Transaction>, CoreError> {
        sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn lock_transaction(
        &mut self,
        order_id: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Transaction::try_from)
        .transpose()
    }

    async fn insert_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError> {
        let sql = "INSERT INTO transactions (id, user_id, package_id, order_id, amount, status, \
                   payment_method, va_number, qr_code_url, snap_token, redirect_url, expiry_time, \
                   paid_at, raw_payload, created_at, updated_at) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";
        self.write_transaction(sql, txn).await.map(|_| ())
    }

    async fn update_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError> {
        let sql = "UPDATE transactions SET user_id = $2, package_id = $3, order_id = $4, \
                   amount = $5, status = $6, payment_method = $7, va_number = $8, \
                   qr_code_url = $9, snap_token = $10, redirect_url = $11, expiry_time = $12, \
                   paid_at = $13, raw_payload = $14, created_at = $15, updated_at = $16 \
                   WHERE id = $1";
        match self.write_transaction(sql, txn).await? {
            0 => Err(CoreError::not_found("transaction", &txn.order_id)),
            _ => Ok(()),
        }
    }

    async fn insert_transaction_event(
        &mut self,
        event: &TransactionEvent,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO transaction_events (id, transaction_id, source, event_type, status, \
             payload, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(event.transaction_id.as_uuid())
        .bind(event.source.as_ref())
        .bind(&event.event_type)
        .bind(event.status.as_ref())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn transaction_events(
        &mut self,
        id: TransactionId,
    ) -> Result<Vec<TransactionEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM transaction_events WHERE transaction_id = $1 ORDER BY created_at",
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn open_transactions(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, CoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE status IN ('unknown', 'pending') \
             AND created_at < $1 ORDER BY created_at",
        )
        .bind(before)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    // ── Manual debts ─────────────────────────────────────────────────

    async fn lock_open_debts(&mut self, user_id: UserId) -> Result<Vec<UserQuotaDebt>, CoreError> {
        let rows = sqlx::query_as::<_, DebtRow>(
            "SELECT * FROM user_quota_debts WHERE user_id = $1 AND NOT is_paid FOR UPDATE",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(UserQuotaDebt::from).collect())
    }

    async fn lock_debt(&mut self, id: DebtId) -> Result<Option<UserQuotaDebt>, CoreError> {
        let row = sqlx::query_as::<_, DebtRow>(
            "SELECT * FROM user_quota_debts WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(UserQuotaDebt::from))
    }

    async fn insert_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        let sql = "INSERT INTO user_quota_debts (id, user_id, debt_date, amount_mb, paid_mb, \
                   is_paid, created_by, note, last_paid_source, paid_at, created_at) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";
        self.write_debt(sql, debt).await
    }

    async fn update_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        let sql = "UPDATE user_quota_debts SET user_id = $2, debt_date = $3, amount_mb = $4, \
                   paid_mb = $5, is_paid = $6, created_by = $7, note = $8, \
                   last_paid_source = $9, paid_at = $10, created_at = $11 WHERE id = $1";
        self.write_debt(sql, debt).await
    }

    // ── Ledger & audits ──────────────────────────────────────────────

    async fn ledger_entry(
        &mut self,
        user_id: UserId,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, CoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM quota_mutation_ledger \
             WHERE user_id = $1 AND source = $2 AND idempotency_key = $3",
        )
        .bind(user_id.as_uuid())
        .bind(source)
        .bind(idempotency_key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(LedgerEntry::from))
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<LedgerAppend, CoreError> {
        sqlx::query("SAVEPOINT ledger_append")
            .execute(&mut *self.tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO quota_mutation_ledger (id, user_id, actor_id, source, idempotency_key, \
             before_state, after_state, event_details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(entry.user_id.as_uuid())
        .bind(entry.actor_id.map(|id| id.as_uuid()))
        .bind(&entry.source)
        .bind(&entry.idempotency_key)
        .bind(&entry.before_state)
        .bind(&entry.after_state)
        .bind(&entry.event_details)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await;

        match inserted {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT ledger_append")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(LedgerAppend::Inserted)
            }
            Err(err) => {
                sqlx::query("ROLLBACK TO SAVEPOINT ledger_append")
                    .execute(&mut *self.tx)
                    .await?;
                match err {
                    sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                        Ok(LedgerAppend::Duplicate)
                    }
                    other => {
                        warn!(source = %entry.source, error = %other, "ledger append failed");
                        Err(other.into())
                    }
                }
            }
        }
    }

    async fn ledger_for_user(&mut self, user_id: UserId) -> Result<Vec<LedgerEntry>, CoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM quota_mutation_ledger WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn insert_address_list_audit(
        &mut self,
        audit: &AddressListAudit,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO address_list_audits (id, user_id, mac, previous_ip, new_ip, list_name, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(audit.id)
        .bind(audit.user_id.as_uuid())
        .bind(audit.mac.as_str())
        .bind(&audit.previous_ip)
        .bind(&audit.new_ip)
        .bind(&audit.list_name)
        .bind(audit.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
