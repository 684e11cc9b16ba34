//! Closed vocabularies persisted as text columns.

use crate::auth::{Principal, Role};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<$name> {
                let t = raw.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(t))
            }

            /// Human-readable list for validation messages.
            pub fn choices() -> String {
                $name::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }
    };
}

text_enum!(AttendanceStatus {
    Present => "present",
    Absent => "absent",
    Late => "late",
    Excused => "excused",
});

text_enum!(TeacherAttendanceStatus {
    Present => "present",
    Absent => "absent",
    Late => "late",
    OnLeave => "on_leave",
});

text_enum!(LeaveStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

text_enum!(LeaveType {
    Sick => "sick",
    Casual => "casual",
    Emergency => "emergency",
    Other => "other",
});

text_enum!(ExamType {
    FirstTerm => "First Term",
    SecondTerm => "Second Term",
    ThirdTerm => "Third Term",
    Final => "Final",
});

text_enum!(Audience {
    Student => "student",
    Teacher => "teacher",
    All => "all",
});

text_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

impl Audience {
    /// Whether a notice with this audience is shown to `role`.
    pub fn reaches(self, role: Role) -> bool {
        match (self, role) {
            (_, Role::School) => true,
            (Audience::All, _) => true,
            (Audience::Student, Role::Student) => true,
            (Audience::Teacher, Role::Teacher) => true,
            _ => false,
        }
    }
}

/// Author of a leave request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    Student(String),
    Teacher(String),
}

impl Requester {
    pub fn kind(&self) -> &'static str {
        match self {
            Requester::Student(_) => "student",
            Requester::Teacher(_) => "teacher",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Requester::Student(id) | Requester::Teacher(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Requester> {
        match kind {
            "student" => Some(Requester::Student(id)),
            "teacher" => Some(Requester::Teacher(id)),
            _ => None,
        }
    }

    /// Requester for a caller; schools never file leave.
    pub fn from_principal(p: &Principal) -> Option<Requester> {
        match p.role {
            Role::Student => Some(Requester::Student(p.id.clone())),
            Role::Teacher => Some(Requester::Teacher(p.id.clone())),
            Role::School => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(AttendanceStatus::parse("Present"), Some(AttendanceStatus::Present));
        assert_eq!(LeaveStatus::parse("approved"), Some(LeaveStatus::Approved));
        assert_eq!(ExamType::parse("final"), Some(ExamType::Final));
        assert_eq!(TeacherAttendanceStatus::parse("excused"), None);
    }

    #[test]
    fn audience_visibility() {
        assert!(Audience::Student.reaches(Role::Student));
        assert!(!Audience::Student.reaches(Role::Teacher));
        assert!(Audience::All.reaches(Role::Teacher));
        assert!(Audience::Teacher.reaches(Role::School));
    }

    #[test]
    fn requester_from_parts() {
        let r = Requester::from_parts("teacher", "t1".into()).unwrap();
        assert_eq!(r, Requester::Teacher("t1".into()));
        assert_eq!(r.kind(), "teacher");
        assert!(Requester::from_parts("school", "x".into()).is_none());
    }
}
