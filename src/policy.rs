use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Hod,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "hod" => Some(Role::Hod),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Hod => "hod",
            Role::Admin => "admin",
        }
    }
}

/// Resolved identity triple supplied by the embedding application on every
/// request that mutates or is scoped by role. The daemon authorizes against
/// it; authentication happened upstream.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
    pub department_id: Option<String>,
}

impl Actor {
    /// Parse the `actor` object out of request params. Error strings are
    /// surfaced verbatim in bad_params responses.
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let Some(obj) = params.get("actor").and_then(|v| v.as_object()) else {
            return Err("actor must be an object".into());
        };
        let user_id = obj
            .get("userId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "actor.userId must be a non-empty string".to_string())?;
        let role_raw = obj
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "actor.role must be a string".to_string())?;
        let role = Role::parse(role_raw)
            .ok_or_else(|| "actor.role must be one of: student, teacher, hod, admin".to_string())?;
        let department_id = match obj.get("departmentId") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let s = v
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| "actor.departmentId must be a non-empty string".to_string())?;
                Some(s.to_string())
            }
        };
        Ok(Actor {
            user_id: user_id.to_string(),
            role,
            department_id,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Sessions are started by teachers (or admins); the new session belongs
    /// to the actor who starts it.
    pub fn may_start_sessions(&self) -> bool {
        matches!(self.role, Role::Teacher | Role::Admin)
    }

    /// Ending a session and marking attendance against it are reserved for
    /// the session's own teacher, admin excepted.
    pub fn may_manage_session(&self, session_teacher_id: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Teacher => self.user_id == session_teacher_id,
            Role::Student | Role::Hod => false,
        }
    }

    /// A change request may be filed by the record's student, the session's
    /// teacher, or an admin.
    pub fn may_dispute_record(&self, record_student_id: &str, session_teacher_id: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Student => self.user_id == record_student_id,
            Role::Teacher => self.user_id == session_teacher_id,
            Role::Hod => false,
        }
    }

    /// Requests are resolved by an hod within the session's department, or
    /// by an admin (unscoped).
    pub fn may_review_changes(&self, session_department_id: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Hod => self.department_id.as_deref() == Some(session_department_id),
            Role::Student | Role::Teacher => false,
        }
    }

    /// The pending-request queue is a review surface: hod and admin only.
    pub fn may_list_pending(&self) -> bool {
        matches!(self.role, Role::Hod | Role::Admin)
    }
}
