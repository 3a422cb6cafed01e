//! Postgres-backed [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rota_core::{CoreError, CoreResult, PodRepository, ProfileStore, Store, StoreTx};
use rota_shared::{
    CommuteProfile, Pod, PodId, PodMembership, ScheduleSlot, UnknownVariant, UserId, Workday,
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

fn storage(e: sqlx::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}

fn corrupt(e: UnknownVariant) -> CoreError {
    CoreError::Storage(format!("corrupt row: {}", e))
}

fn day_names(days: &[Workday]) -> Vec<String> {
    days.iter().map(|d| d.as_str().to_string()).collect()
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    user_id: Uuid,
    preference: String,
    home_key: String,
    work_key: String,
    departure_time: String,
    match_key: String,
    is_on_leave: bool,
    leave_start: Option<NaiveDate>,
    leave_end: Option<NaiveDate>,
    open_to_suggestions: bool,
    strikes: i32,
}

impl TryFrom<ProfileRow> for CommuteProfile {
    type Error = CoreError;

    fn try_from(row: ProfileRow) -> CoreResult<Self> {
        Ok(CommuteProfile {
            user_id: row.user_id,
            preference: row.preference.parse().map_err(corrupt)?,
            home_key: row.home_key,
            work_key: row.work_key,
            departure_time: row.departure_time,
            match_key: row.match_key,
            is_on_leave: row.is_on_leave,
            leave_start: row.leave_start,
            leave_end: row.leave_end,
            open_to_suggestions: row.open_to_suggestions,
            strikes: row.strikes,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PodRow {
    id: Uuid,
    name: String,
    match_key: String,
    origin: String,
    destination: String,
    needs_replacement: bool,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PodRow> for Pod {
    type Error = CoreError;

    fn try_from(row: PodRow) -> CoreResult<Self> {
        Ok(Pod {
            id: row.id,
            name: row.name,
            match_key: row.match_key,
            origin: row.origin,
            destination: row.destination,
            needs_replacement: row.needs_replacement,
            status: row.status.parse().map_err(corrupt)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    pod_id: Uuid,
    user_id: Uuid,
    role: String,
    joined_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<MembershipRow> for PodMembership {
    type Error = CoreError;

    fn try_from(row: MembershipRow) -> CoreResult<Self> {
        Ok(PodMembership {
            pod_id: row.pod_id,
            user_id: row.user_id,
            role: row.role.parse().map_err(corrupt)?,
            joined_at: row.joined_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SlotRow {
    pod_id: Uuid,
    day: String,
    driver_id: Uuid,
    departure_time: String,
}

impl TryFrom<SlotRow> for ScheduleSlot {
    type Error = CoreError;

    fn try_from(row: SlotRow) -> CoreResult<Self> {
        Ok(ScheduleSlot {
            pod_id: row.pod_id,
            day: row.day.parse().map_err(corrupt)?,
            driver_id: row.driver_id,
            departure_time: row.departure_time,
        })
    }
}

fn convert<R, T>(rows: Vec<R>) -> CoreResult<Vec<T>>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const PROFILE_COLUMNS: &str = "user_id, preference, home_key, work_key, departure_time, match_key, \
     is_on_leave, leave_start, leave_end, open_to_suggestions, strikes";
const POD_COLUMNS: &str =
    "id, name, match_key, origin, destination, needs_replacement, status, created_at";
const MEMBERSHIP_COLUMNS: &str = "pod_id, user_id, role, joined_at, expires_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(storage)?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

/// Rolled back by sqlx when dropped uncommitted.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn commit(self: Box<Self>) -> CoreResult<()> {
        self.tx.commit().await.map_err(storage)
    }
}

#[async_trait]
impl ProfileStore for PgStoreTx {
    async fn get_profile(&mut self, user_id: UserId) -> CoreResult<Option<CommuteProfile>> {
        let sql = format!("SELECT {} FROM commute_profiles WHERE user_id = $1", PROFILE_COLUMNS);
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage)?;
        row.map(CommuteProfile::try_from).transpose()
    }

    async fn save_profile(&mut self, profile: &CommuteProfile) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO commute_profiles (user_id, preference, home_key, work_key, departure_time, match_key,
                                          is_on_leave, leave_start, leave_end, open_to_suggestions, strikes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id) DO UPDATE SET
                preference = EXCLUDED.preference,
                home_key = EXCLUDED.home_key,
                work_key = EXCLUDED.work_key,
                departure_time = EXCLUDED.departure_time,
                match_key = EXCLUDED.match_key,
                is_on_leave = EXCLUDED.is_on_leave,
                leave_start = EXCLUDED.leave_start,
                leave_end = EXCLUDED.leave_end,
                open_to_suggestions = EXCLUDED.open_to_suggestions,
                strikes = EXCLUDED.strikes
            "#,
        )
        .bind(profile.user_id)
        .bind(profile.preference.as_str())
        .bind(&profile.home_key)
        .bind(&profile.work_key)
        .bind(&profile.departure_time)
        .bind(&profile.match_key)
        .bind(profile.is_on_leave)
        .bind(profile.leave_start)
        .bind(profile.leave_end)
        .bind(profile.open_to_suggestions)
        .bind(profile.strikes)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn unmatched_rotation_profiles(&mut self) -> CoreResult<Vec<CommuteProfile>> {
        let sql = format!(
            "SELECT {} FROM commute_profiles p \
             WHERE p.preference = 'ROTATION' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM pod_memberships m JOIN pods d ON d.id = m.pod_id \
                   WHERE m.user_id = p.user_id AND d.status = 'ACTIVE') \
             ORDER BY p.user_id",
            PROFILE_COLUMNS
        );
        let rows: Vec<ProfileRow> = sqlx::query_as(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn guest_candidates(
        &mut self,
        match_key: &str,
        limit: usize,
    ) -> CoreResult<Vec<CommuteProfile>> {
        let sql = format!(
            "SELECT {} FROM commute_profiles p \
             WHERE p.match_key = $1 \
               AND p.preference = 'CARPOOL' \
               AND p.open_to_suggestions \
               AND NOT p.is_on_leave \
               AND NOT EXISTS ( \
                   SELECT 1 FROM pod_memberships m JOIN pods d ON d.id = m.pod_id \
                   WHERE m.user_id = p.user_id AND d.status = 'ACTIVE') \
             ORDER BY p.strikes, p.user_id \
             LIMIT $2",
            PROFILE_COLUMNS
        );
        let rows: Vec<ProfileRow> = sqlx::query_as(&sql)
            .bind(match_key)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn profiles_with_elapsed_leave(
        &mut self,
        today: NaiveDate,
    ) -> CoreResult<Vec<CommuteProfile>> {
        let sql = format!(
            "SELECT {} FROM commute_profiles WHERE is_on_leave AND leave_end <= $1 ORDER BY user_id",
            PROFILE_COLUMNS
        );
        let rows: Vec<ProfileRow> = sqlx::query_as(&sql)
            .bind(today)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn carpool_profiles_in_cells(
        &mut self,
        cells: &[String],
    ) -> CoreResult<Vec<CommuteProfile>> {
        let sql = format!(
            "SELECT {} FROM commute_profiles \
             WHERE preference = 'CARPOOL' AND home_key = ANY($1) \
             ORDER BY user_id",
            PROFILE_COLUMNS
        );
        let rows: Vec<ProfileRow> = sqlx::query_as(&sql)
            .bind(cells.to_vec())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }
}

#[async_trait]
impl PodRepository for PgStoreTx {
    async fn get_pod(&mut self, pod_id: PodId) -> CoreResult<Option<Pod>> {
        let sql = format!("SELECT {} FROM pods WHERE id = $1", POD_COLUMNS);
        let row: Option<PodRow> = sqlx::query_as(&sql)
            .bind(pod_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage)?;
        row.map(Pod::try_from).transpose()
    }

    async fn lock_pod(&mut self, pod_id: PodId) -> CoreResult<Option<Pod>> {
        let sql = format!("SELECT {} FROM pods WHERE id = $1 FOR UPDATE", POD_COLUMNS);
        let row: Option<PodRow> = sqlx::query_as(&sql)
            .bind(pod_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage)?;
        row.map(Pod::try_from).transpose()
    }

    async fn open_pods_for_keys(&mut self, keys: &[String]) -> CoreResult<Vec<Pod>> {
        let sql = format!(
            "SELECT {} FROM pods \
             WHERE status = 'ACTIVE' AND needs_replacement AND match_key = ANY($1) \
             ORDER BY created_at, id",
            POD_COLUMNS
        );
        let rows: Vec<PodRow> = sqlx::query_as(&sql)
            .bind(keys.to_vec())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn insert_pod(&mut self, pod: &Pod) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pods (id, name, match_key, origin, destination, needs_replacement, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(pod.id)
        .bind(&pod.name)
        .bind(&pod.match_key)
        .bind(&pod.origin)
        .bind(&pod.destination)
        .bind(pod.needs_replacement)
        .bind(pod.status.as_str())
        .bind(pod.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn update_pod(&mut self, pod: &Pod) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pods
            SET name = $2, match_key = $3, origin = $4, destination = $5,
                needs_replacement = $6, status = $7
            WHERE id = $1
            "#,
        )
        .bind(pod.id)
        .bind(&pod.name)
        .bind(&pod.match_key)
        .bind(&pod.origin)
        .bind(&pod.destination)
        .bind(pod.needs_replacement)
        .bind(pod.status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::PodNotFound(pod.id));
        }
        Ok(())
    }

    async fn memberships(&mut self, pod_id: PodId) -> CoreResult<Vec<PodMembership>> {
        let sql = format!(
            "SELECT {} FROM pod_memberships WHERE pod_id = $1 ORDER BY joined_at, user_id",
            MEMBERSHIP_COLUMNS
        );
        let rows: Vec<MembershipRow> = sqlx::query_as(&sql)
            .bind(pod_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn memberships_for_user(&mut self, user_id: UserId) -> CoreResult<Vec<PodMembership>> {
        let sql = format!(
            "SELECT {} FROM pod_memberships \
             WHERE user_id = $1 AND pod_id IN (SELECT id FROM pods WHERE status = 'ACTIVE') \
             ORDER BY joined_at",
            MEMBERSHIP_COLUMNS
        );
        let rows: Vec<MembershipRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn insert_membership(&mut self, membership: &PodMembership) -> CoreResult<()> {
        sqlx::query(
            r#"
            DELETE FROM pod_memberships
            WHERE user_id = $1 AND pod_id IN (SELECT id FROM pods WHERE status = 'COLLAPSED')
            "#,
        )
        .bind(membership.user_id)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;

        let result = sqlx::query(
            r#"
            INSERT INTO pod_memberships (pod_id, user_id, role, joined_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(membership.pod_id)
        .bind(membership.user_id)
        .bind(membership.role.as_str())
        .bind(membership.joined_at)
        .bind(membership.expires_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::AlreadyInPod(membership.user_id))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn delete_membership(&mut self, pod_id: PodId, user_id: UserId) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM pod_memberships WHERE pod_id = $1 AND user_id = $2")
            .bind(pod_id)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_guests(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<PodMembership>> {
        let sql = format!(
            "SELECT {} FROM pod_memberships \
             WHERE role = 'GUEST' AND expires_at <= $1 \
             ORDER BY expires_at, pod_id, user_id",
            MEMBERSHIP_COLUMNS
        );
        let rows: Vec<MembershipRow> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage)?;
        convert(rows)
    }

    async fn slots(&mut self, pod_id: PodId) -> CoreResult<Vec<ScheduleSlot>> {
        let rows: Vec<SlotRow> = sqlx::query_as(
            "SELECT pod_id, day, driver_id, departure_time FROM schedule_slots WHERE pod_id = $1",
        )
        .bind(pod_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage)?;

        // Day names do not sort in week order.
        let mut slots: Vec<ScheduleSlot> = convert(rows)?;
        slots.sort_by_key(|s| s.day);
        Ok(slots)
    }

    async fn insert_slots(&mut self, slots: &[ScheduleSlot]) -> CoreResult<()> {
        for slot in slots {
            sqlx::query(
                r#"
                INSERT INTO schedule_slots (pod_id, day, driver_id, departure_time)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(slot.pod_id)
            .bind(slot.day.as_str())
            .bind(slot.driver_id)
            .bind(&slot.departure_time)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        }
        Ok(())
    }

    async fn delete_all_slots(&mut self, pod_id: PodId) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM schedule_slots WHERE pod_id = $1")
            .bind(pod_id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn delete_slots_on(&mut self, pod_id: PodId, days: &[Workday]) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM schedule_slots WHERE pod_id = $1 AND day = ANY($2)")
            .bind(pod_id)
            .bind(day_names(days))
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn delete_driver_slots_on(
        &mut self,
        pod_id: PodId,
        driver_id: UserId,
        days: &[Workday],
    ) -> CoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM schedule_slots WHERE pod_id = $1 AND driver_id = $2 AND day = ANY($3)",
        )
        .bind(pod_id)
        .bind(driver_id)
        .bind(day_names(days))
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_row_with_unknown_day_is_rejected() {
        let row = SlotRow {
            pod_id: Uuid::new_v4(),
            day: "SATURDAY".to_string(),
            driver_id: Uuid::new_v4(),
            departure_time: "06:30".to_string(),
        };
        assert!(matches!(ScheduleSlot::try_from(row), Err(CoreError::Storage(_))));
    }

    #[test]
    fn test_day_names_use_storage_spelling() {
        assert_eq!(day_names(&[Workday::Monday, Workday::Friday]), vec!["MONDAY", "FRIDAY"]);
    }
}
